//! Gzipped tar snapshots.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::util::fs::remove_path;

/// Unpack `archive` so that `dest` appears complete or not at all.
///
/// The archive is extracted next to `dest` and renamed into place. If `dest`
/// already exists the staged copy is discarded.
pub fn unpack_archive(archive: &Path, dest: &Path) -> io::Result<()> {
  let parent = dest
    .parent()
    .ok_or_else(|| io::Error::other(format!("no parent for {}", dest.display())))?;
  fs::create_dir_all(parent)?;

  let staging = tempfile::Builder::new().prefix(".unpack-").tempdir_in(parent)?;
  let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
  tar.set_preserve_permissions(true);
  tar.set_overwrite(true);
  tar.unpack(staging.path())?;

  let staged = staging.keep();
  match fs::rename(&staged, dest) {
    Ok(()) => {
      debug!(archive = ?archive, dest = ?dest, "unpacked base archive");
      Ok(())
    }
    Err(_) if dest.is_dir() => remove_path(&staged),
    Err(e) => {
      let _ = remove_path(&staged);
      Err(e)
    }
  }
}

/// Pack the contents of `src` into a gzipped tar at `archive`.
pub fn pack_directory(src: &Path, archive: &Path) -> io::Result<()> {
  let file = File::create(archive)?;
  let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
  builder.follow_symlinks(false);
  builder.append_dir_all(".", src)?;
  builder.into_inner()?.finish()?;
  Ok(())
}
