//! Filesystem steps: directory provisioning and source materialization.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::StepError;
use crate::util::fs::{copy_tree, remove_path};

/// Host location of an absolute image path inside `rootfs`.
pub fn rootfs_path(rootfs: &Path, image_path: &str) -> PathBuf {
  let rel = image_path.trim_start_matches('/');
  if rel.is_empty() {
    rootfs.to_path_buf()
  } else {
    rootfs.join(rel)
  }
}

/// Symlinks followed while resolving one image path.
const MAX_SYMLINK_HOPS: usize = 40;

/// Create `image_path` and any missing parents inside `rootfs`.
///
/// Returns whether anything was created. An existing directory is left alone;
/// an existing non-directory anywhere along the path is a conflict. Symlinks in
/// the rootfs are followed as the image would see them, so an absolute target
/// such as `/var/run -> /run` stays inside `rootfs`.
pub fn ensure_directory(rootfs: &Path, image_path: &str) -> Result<bool, StepError> {
  let (_, created) = provision(rootfs, image_path)?;
  if created {
    info!(path = %image_path, "directory created");
  } else {
    debug!(path = %image_path, "directory already present");
  }
  Ok(created)
}

/// Like [`ensure_directory`], returning the host path the directory resolved to.
pub fn directory_in_rootfs(rootfs: &Path, image_path: &str) -> Result<PathBuf, StepError> {
  let (dir, created) = provision(rootfs, image_path)?;
  if created {
    info!(path = %image_path, "directory created");
  }
  Ok(dir)
}

fn segments(path: &str) -> impl Iterator<Item = String> + '_ {
  path.split('/').filter(|s| !s.is_empty() && *s != ".").map(str::to_string)
}

fn provision(rootfs: &Path, image_path: &str) -> Result<(PathBuf, bool), StepError> {
  fs::create_dir_all(rootfs).map_err(StepError::io(rootfs))?;
  walk(rootfs, image_path, true)?.ok_or_else(|| StepError::PathConflict {
    path: image_path.to_string(),
  })
}

/// Host path of an existing entry inside `rootfs`, without following a final symlink.
///
/// Intermediate symlinks resolve inside the rootfs. `None` when the entry does
/// not exist.
pub fn existing_in_rootfs(rootfs: &Path, image_path: &str) -> Result<Option<PathBuf>, StepError> {
  let mut parts: Vec<String> = segments(image_path).collect();
  let Some(name) = parts.pop() else {
    return Ok(Some(rootfs.to_path_buf()));
  };
  if name == ".." {
    return Ok(None);
  }
  let parent = format!("/{}", parts.join("/"));
  let Some((dir, _)) = walk(rootfs, &parent, false)? else {
    return Ok(None);
  };
  let path = dir.join(name);
  Ok(fs::symlink_metadata(&path).is_ok().then_some(path))
}

/// Resolve `image_path` segment by segment below `rootfs`.
///
/// With `create`, missing directories are made; without it a missing or
/// non-directory segment ends the walk with `None`.
fn walk(rootfs: &Path, image_path: &str, create: bool) -> Result<Option<(PathBuf, bool)>, StepError> {
  let mut pending: VecDeque<String> = segments(image_path).collect();
  let mut resolved: Vec<String> = Vec::new();
  let mut hops = 0;
  let mut created = false;

  while let Some(segment) = pending.pop_front() {
    if segment == ".." {
      resolved.pop();
      continue;
    }

    let current = resolved.iter().fold(rootfs.to_path_buf(), |p, s| p.join(s)).join(&segment);
    let image = format!("/{}", resolved.iter().chain([&segment]).cloned().collect::<Vec<_>>().join("/"));

    match fs::symlink_metadata(&current) {
      Ok(meta) if meta.is_dir() => resolved.push(segment),
      Ok(meta) if meta.file_type().is_symlink() => {
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
          return Err(StepError::PathConflict { path: image });
        }
        let link = fs::read_link(&current).map_err(StepError::io(&current))?;
        let target = link.to_string_lossy();
        if target.starts_with('/') {
          resolved.clear();
        }
        for part in segments(&target).collect::<Vec<_>>().into_iter().rev() {
          pending.push_front(part);
        }
      }
      Ok(_) if !create => return Ok(None),
      Ok(_) => return Err(StepError::PathConflict { path: image }),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        if !create {
          return Ok(None);
        }
        fs::create_dir(&current).map_err(StepError::io(&current))?;
        created = true;
        resolved.push(segment);
      }
      Err(e) => {
        return Err(StepError::Io {
          path: current,
          source: e,
        });
      }
    }
  }

  let dir = resolved.iter().fold(rootfs.to_path_buf(), |p, s| p.join(s));
  Ok(Some((dir, created)))
}

/// Copy the source tree at `src` into `dest` inside the rootfs.
///
/// A single file is copied into the destination directory under its own name.
pub fn materialize_source(src: &Path, rootfs: &Path, dest: &str, exclude: &[String]) -> Result<u64, StepError> {
  let target = directory_in_rootfs(rootfs, dest)?;

  let meta = fs::metadata(src).map_err(StepError::io(src))?;
  let copied = if meta.is_file() {
    let name = src.file_name().ok_or_else(|| StepError::Io {
      path: src.to_path_buf(),
      source: std::io::Error::other("source has no file name"),
    })?;
    let file = target.join(name);
    remove_path(&file).map_err(StepError::io(&file))?;
    fs::copy(src, &file).map_err(StepError::io(src))?;
    1
  } else {
    let excludes: Vec<&str> = exclude.iter().map(String::as_str).collect();
    copy_tree(src, &target, &excludes).map_err(StepError::io(src))?
  };

  info!(src = ?src, dest = %dest, files = copied, "source materialized");
  Ok(copied)
}
