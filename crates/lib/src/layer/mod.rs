//! Content-addressed layer keys and the layer store.
//!
//! Every step's key hashes its parent key, the full step definition and the
//! content of any build-context files it reads. Identical ordered steps over
//! identical inputs therefore produce identical keys, and a change to one
//! step's inputs changes that key and every key after it.

mod store;

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub use store::{CachedLayer, LayerMarker, LayerStore, PublishOutcome};

use crate::recipe::{BuildStep, StepKind};
use crate::registry::BaseImageRef;
use crate::util::hash::{ContentHash, DirHashError, HashError, Hashable, ObjectHash, hash_directory, hash_file};

/// Key of one layer in the store.
pub type LayerKey = ObjectHash;

#[derive(Debug, Error)]
pub enum LayerError {
  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to hash build input {path}: {source}")]
  Inputs {
    path: PathBuf,
    #[source]
    source: DirHashError,
  },

  #[error("failed to hash layer contents: {0}")]
  Contents(#[from] DirHashError),

  #[error("failed to compute layer key: {0}")]
  Key(#[source] HashError),

  #[error("layer {key} vanished while publishing")]
  Vanished { key: LayerKey },
}

impl LayerError {
  pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
    move |source| LayerError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

#[derive(Serialize)]
struct BaseKeyInput<'a> {
  name: &'a str,
  tag: &'a str,
  digest: &'a str,
}

impl Hashable for BaseKeyInput<'_> {}

#[derive(Serialize)]
struct StepKeyInput<'a> {
  parent: &'a LayerKey,
  step: &'a StepKind,
  inputs: Option<&'a ContentHash>,
}

impl Hashable for StepKeyInput<'_> {}

/// Root of the key chain.
pub fn base_key(base: &BaseImageRef) -> Result<LayerKey, LayerError> {
  BaseKeyInput {
    name: &base.id,
    tag: &base.version,
    digest: &base.digest,
  }
  .compute_hash()
  .map_err(LayerError::Key)
}

pub fn step_key(parent: &LayerKey, step: &StepKind, inputs: Option<&ContentHash>) -> Result<LayerKey, LayerError> {
  StepKeyInput { parent, step, inputs }.compute_hash().map_err(LayerError::Key)
}

/// Hash of the build-context files a step reads, if any.
///
/// A `SourceMount` reads nothing, so a mounted source never invalidates it.
pub fn step_inputs(step: &StepKind, context_dir: &Path) -> Result<Option<ContentHash>, LayerError> {
  match step {
    StepKind::FileCopy { src, exclude, .. } => {
      let path = context_dir.join(src);
      let excludes: Vec<&str> = exclude.iter().map(String::as_str).collect();
      let hash = if path.is_file() {
        hash_file(&path)
      } else {
        hash_directory(&path, &excludes)
      };
      hash.map(Some).map_err(|source| LayerError::Inputs { path, source })
    }
    StepKind::ManifestInstall { manifest, .. } => {
      let path = context_dir.join(manifest);
      hash_file(&path).map(Some).map_err(|source| LayerError::Inputs { path, source })
    }
    _ => Ok(None),
  }
}

/// Keys for every step, in order, chained from `root`.
pub fn compute_keys(root: &LayerKey, steps: &[BuildStep], context_dir: &Path) -> Result<Vec<LayerKey>, LayerError> {
  let mut keys = Vec::with_capacity(steps.len());
  let mut parent = root.clone();
  for step in steps {
    let inputs = step_inputs(&step.kind, context_dir)?;
    let key = step_key(&parent, &step.kind, inputs.as_ref())?;
    keys.push(key.clone());
    parent = key;
  }
  Ok(keys)
}
