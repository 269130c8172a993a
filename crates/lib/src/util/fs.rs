//! Filesystem helpers shared by the step executors and the layer store.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use walkdir::WalkDir;

/// Recursively copy `src` into `dst`.
///
/// `dst` is created if missing and existing files are overwritten. Symlinks are
/// recreated rather than followed, and Unix permission bits are preserved.
/// Entries whose file name appears in `exclude` are skipped with their subtree.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[&str]) -> io::Result<u64> {
  fs::create_dir_all(dst)?;
  let mut copied = 0;
  let mut dirs = Vec::new();

  let walker = WalkDir::new(src).sort_by_file_name().into_iter().filter_entry(|e| {
    e.depth() == 0
      || e
        .file_name()
        .to_str()
        .map(|name| !exclude.contains(&name))
        .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    if rel.as_os_str().is_empty() {
      continue;
    }
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      if target.is_symlink() || (target.exists() && !target.is_dir()) {
        fs::remove_file(&target)?;
      }
      fs::create_dir_all(&target)?;
      dirs.push((entry.path().to_path_buf(), target));
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path())?;
      remove_path(&target)?;
      symlink(&link, &target)?;
      copied += 1;
    } else if file_type.is_file() {
      if target.is_symlink() || target.is_dir() {
        remove_path(&target)?;
      }
      fs::copy(entry.path(), &target)?;
      copied += 1;
    }
  }

  // Directory modes last, so read-only directories can still be filled.
  for (src_dir, target) in dirs.iter().rev() {
    copy_permissions(src_dir, target)?;
  }

  Ok(copied)
}

/// Serialize `value` as pretty JSON and move it into place with a rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| io::Error::other(format!("no parent for {}", path.display())))?;
  fs::create_dir_all(parent)?;

  let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
  serde_json::to_writer_pretty(&mut tmp, value).map_err(io::Error::other)?;
  tmp.write_all(b"\n")?;
  tmp.as_file().sync_all()?;
  tmp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
  let content = fs::read_to_string(path)?;
  serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Remove a file, symlink or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
  match fs::symlink_metadata(path) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

/// Total size in bytes of the regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(original, link)
}

fn copy_permissions(src: &Path, dst: &Path) -> io::Result<()> {
  let perms = fs::metadata(src)?.permissions();
  fs::set_permissions(dst, perms)
}
