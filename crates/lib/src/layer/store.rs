//! On-disk layer storage.
//!
//! Layers are written once. A layer is staged under `tmp/`, gets its marker
//! last and is then renamed to `layers/<key>`, so a directory under `layers/`
//! with a valid marker is always complete. Anything else found there is
//! treated as a miss and removed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{LayerError, LayerKey};
use crate::consts::{LAYER_MARKER, LAYER_ROOTFS_DIR};
use crate::recipe::StepKind;
use crate::util::fs::{copy_tree, read_json, remove_path, write_json_atomic};
use crate::util::hash::hash_directory;

const MARKER_VERSION: u32 = 1;

/// Written last into a layer directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMarker {
  pub version: u32,
  pub key: LayerKey,
  pub parent: LayerKey,
  pub step_index: usize,
  pub step: StepKind,
  /// Whether the layer carries a rootfs snapshot.
  pub fs_changed: bool,
  /// Tree hash of `rootfs/`, present when `fs_changed`.
  pub output_hash: Option<String>,
  pub created_at_unix: u64,
}

/// A verified layer found in the store.
#[derive(Debug, Clone)]
pub struct CachedLayer {
  pub marker: LayerMarker,
  pub rootfs: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
  Published,
  /// Another build published the same key first; ours was discarded.
  AlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct LayerStore {
  root: PathBuf,
}

impl LayerStore {
  pub fn new(root: PathBuf) -> Self {
    Self { root }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn layers_dir(&self) -> PathBuf {
    self.root.join("layers")
  }

  pub fn bases_dir(&self) -> PathBuf {
    self.root.join("bases")
  }

  pub fn images_dir(&self) -> PathBuf {
    self.root.join("images")
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.root.join("tmp")
  }

  pub fn layer_dir(&self, key: &LayerKey) -> PathBuf {
    self.layers_dir().join(&key.0)
  }

  pub fn rootfs_path(&self, key: &LayerKey) -> PathBuf {
    self.layer_dir(key).join(LAYER_ROOTFS_DIR)
  }

  /// Read a marker without verifying the layer contents.
  pub fn read_marker(&self, key: &LayerKey) -> Option<LayerMarker> {
    read_json(&self.layer_dir(key).join(LAYER_MARKER)).ok()
  }

  /// Whether a layer directory exists with a readable marker for `key`.
  pub fn contains(&self, key: &LayerKey) -> bool {
    self.read_marker(key).is_some_and(|m| &m.key == key)
  }

  /// Look up a layer, verifying its marker and contents.
  ///
  /// Incomplete or corrupted layers are removed and reported as a miss.
  pub fn lookup(&self, key: &LayerKey) -> Result<Option<CachedLayer>, LayerError> {
    let dir = self.layer_dir(key);
    if !dir.exists() {
      return Ok(None);
    }

    let marker = match read_json::<LayerMarker>(&dir.join(LAYER_MARKER)) {
      Ok(m) if &m.key == key && m.version == MARKER_VERSION => m,
      Ok(_) => {
        warn!(key = %key, "layer marker does not match, removing");
        remove_path(&dir).map_err(LayerError::io(&dir))?;
        return Ok(None);
      }
      Err(e) => {
        warn!(key = %key, error = %e, "layer incomplete, removing");
        remove_path(&dir).map_err(LayerError::io(&dir))?;
        return Ok(None);
      }
    };

    if !marker.fs_changed {
      return Ok(Some(CachedLayer { marker, rootfs: None }));
    }

    let rootfs = dir.join(LAYER_ROOTFS_DIR);
    let verified = rootfs.is_dir()
      && match (&marker.output_hash, hash_directory(&rootfs, &[])) {
        (Some(expected), Ok(actual)) => expected == &actual.0,
        _ => false,
      };

    if !verified {
      warn!(key = %key, "layer contents do not match marker, removing");
      remove_path(&dir).map_err(LayerError::io(&dir))?;
      return Ok(None);
    }

    debug!(key = %key, "layer verified");
    Ok(Some(CachedLayer {
      marker,
      rootfs: Some(rootfs),
    }))
  }

  /// Publish a layer for `key`.
  ///
  /// With `rootfs = Some(dir)` the directory is snapshotted into the layer;
  /// with `None` only the marker is written.
  pub fn publish(
    &self,
    key: &LayerKey,
    parent: &LayerKey,
    step_index: usize,
    step: &StepKind,
    rootfs: Option<&Path>,
  ) -> Result<PublishOutcome, LayerError> {
    let tmp = self.tmp_dir();
    fs::create_dir_all(&tmp).map_err(LayerError::io(&tmp))?;
    let layers = self.layers_dir();
    fs::create_dir_all(&layers).map_err(LayerError::io(&layers))?;

    let staging = tempfile::Builder::new()
      .prefix(&format!("layer-{}-", key.0))
      .tempdir_in(&tmp)
      .map_err(LayerError::io(&tmp))?;

    let output_hash = match rootfs {
      Some(src) => {
        let dest = staging.path().join(LAYER_ROOTFS_DIR);
        copy_tree(src, &dest, &[]).map_err(LayerError::io(src))?;
        Some(hash_directory(&dest, &[])?.0)
      }
      None => None,
    };

    let marker = LayerMarker {
      version: MARKER_VERSION,
      key: key.clone(),
      parent: parent.clone(),
      step_index,
      step: step.clone(),
      fs_changed: rootfs.is_some(),
      output_hash,
      created_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    let marker_path = staging.path().join(LAYER_MARKER);
    write_json_atomic(&marker_path, &marker).map_err(LayerError::io(&marker_path))?;

    let dest = self.layer_dir(key);
    let staged = staging.keep();
    match fs::rename(&staged, &dest) {
      Ok(()) => {
        info!(key = %key, step = step_index, fs_changed = marker.fs_changed, "layer published");
        Ok(PublishOutcome::Published)
      }
      Err(_) if dest.exists() => {
        if self.lookup(key)?.is_some() {
          debug!(key = %key, "layer already published, discarding staged copy");
          remove_path(&staged).map_err(LayerError::io(&staged))?;
          return Ok(PublishOutcome::AlreadyPresent);
        }
        // lookup removed the invalid entry
        fs::rename(&staged, &dest).map_err(LayerError::io(&dest))?;
        info!(key = %key, step = step_index, "layer republished over invalid entry");
        Ok(PublishOutcome::Published)
      }
      Err(e) => {
        let _ = remove_path(&staged);
        Err(LayerError::Io { path: dest, source: e })
      }
    }
  }

  /// Replace `dest` with a copy of the layer's rootfs.
  pub fn restore(&self, key: &LayerKey, dest: &Path) -> Result<(), LayerError> {
    let src = self.rootfs_path(key);
    if !src.is_dir() {
      return Err(LayerError::Vanished { key: key.clone() });
    }
    remove_path(dest).map_err(LayerError::io(dest))?;
    copy_tree(&src, dest, &[]).map_err(LayerError::io(&src))?;
    Ok(())
  }

  /// Every key with a directory under `layers/`, sorted.
  pub fn list(&self) -> Result<Vec<LayerKey>, LayerError> {
    let dir = self.layers_dir();
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(LayerError::Io { path: dir, source: e }),
    };

    let mut keys: Vec<LayerKey> = entries
      .filter_map(|e| e.ok())
      .filter(|e| e.path().is_dir())
      .map(|e| LayerKey::from(e.file_name().to_string_lossy().as_ref()))
      .collect();
    keys.sort();
    Ok(keys)
  }

  pub fn remove(&self, key: &LayerKey) -> Result<(), LayerError> {
    let dir = self.layer_dir(key);
    remove_path(&dir).map_err(LayerError::io(&dir))
  }
}
