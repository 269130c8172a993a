//! Store garbage collection.
//!
//! Layers named by an image record are live. Everything else under
//! `layers/`, every staging directory under `tmp/` and every unpacked base no
//! record refers to is removed. Callers hold the exclusive store lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs, io};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::image::{ImageError, ImageStore};
use crate::layer::{LayerKey, LayerStore};
use crate::util::fs::{dir_size, remove_path};

#[derive(Debug, Error)]
pub enum GcError {
  #[error("failed to list images: {0}")]
  ListImages(#[from] ImageError),

  #[error("failed to read store directory: {0}")]
  ReadStore(#[from] io::Error),
}

#[derive(Debug, Default, serde::Serialize)]
pub struct GcStats {
  pub images_scanned: usize,
  pub layers_scanned: usize,
  pub layers_deleted: usize,
  pub layers_bytes_freed: u64,
  pub staging_deleted: usize,
  pub staging_bytes_freed: u64,
  pub bases_deleted: usize,
  pub bases_bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.layers_deleted + self.staging_deleted + self.bases_deleted
  }

  pub fn total_bytes_freed(&self) -> u64 {
    self.layers_bytes_freed + self.staging_bytes_freed + self.bases_bytes_freed
  }
}

#[derive(Debug, serde::Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

struct LiveSet {
  layers: HashSet<String>,
  bases: HashSet<String>,
}

fn collect_live(images: &ImageStore, stats: &mut GcStats) -> Result<LiveSet, GcError> {
  let mut live = LiveSet {
    layers: HashSet::new(),
    bases: HashSet::new(),
  };

  for record in images.list()? {
    stats.images_scanned += 1;
    live.layers.extend(record.layers.iter().map(|k| k.0.clone()));
    live.bases.insert(record.base.digest.clone());
  }

  debug!(layers = live.layers.len(), bases = live.bases.len(), "collected live entries from image records");
  Ok(live)
}

enum Kind {
  Layer,
  Staging,
  Base,
}

pub fn collect_garbage(store: &Path, dry_run: bool) -> Result<GcResult, GcError> {
  let layers = LayerStore::new(store.to_path_buf());
  let images = ImageStore::new(layers.images_dir());

  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();
  let live = collect_live(&images, &mut stats)?;

  for path in subdirs(&layers.layers_dir())? {
    stats.layers_scanned += 1;
    let name = file_name(&path);
    let marker_ok = layers.contains(&LayerKey::from(name.as_str()));
    if live.layers.contains(&name) && marker_ok {
      continue;
    }
    if marker_ok {
      debug!(path = %path.display(), "removing unreferenced layer");
    } else {
      debug!(path = %path.display(), "removing incomplete layer");
    }
    sweep(&path, Kind::Layer, dry_run, &mut stats, &mut deleted_paths);
  }

  for path in subdirs(&layers.tmp_dir())? {
    debug!(path = %path.display(), "removing staging directory");
    sweep(&path, Kind::Staging, dry_run, &mut stats, &mut deleted_paths);
  }

  for path in subdirs(&layers.bases_dir())? {
    if live.bases.contains(&file_name(&path)) {
      continue;
    }
    debug!(path = %path.display(), "removing unreferenced base");
    sweep(&path, Kind::Base, dry_run, &mut stats, &mut deleted_paths);
  }

  info!(
    layers_deleted = stats.layers_deleted,
    staging_deleted = stats.staging_deleted,
    bases_deleted = stats.bases_deleted,
    bytes_freed = stats.total_bytes_freed(),
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult { stats, deleted_paths })
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, GcError> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e.into()),
  };
  let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
  paths.sort();
  Ok(paths)
}

fn file_name(path: &Path) -> String {
  path
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default()
}

fn sweep(path: &Path, kind: Kind, dry_run: bool, stats: &mut GcStats, deleted_paths: &mut Vec<PathBuf>) {
  let size = dir_size(path);
  if !dry_run
    && let Err(e) = remove_path(path)
  {
    warn!(path = %path.display(), error = %e, "failed to delete directory");
    return;
  }

  let (count, bytes) = match kind {
    Kind::Layer => (&mut stats.layers_deleted, &mut stats.layers_bytes_freed),
    Kind::Staging => (&mut stats.staging_deleted, &mut stats.staging_bytes_freed),
    Kind::Base => (&mut stats.bases_deleted, &mut stats.bases_bytes_freed),
  };
  *count += 1;
  *bytes += size;
  deleted_paths.push(path.to_path_buf());
}
