use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::image::ImageError;
use crate::layer::LayerError;
use crate::recipe::RecipeError;
use crate::steps::StepError;
use crate::store_lock::StoreLockError;

/// Why a build attempt ended in `Failed`. None of these are retried.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("base {base} could not be resolved: {reason}")]
  UnresolvedBase { base: String, reason: String },

  #[error("step {} failed with exit code {}", step_index + 1, fmt_code(*exit_code))]
  StepExecution {
    step_index: usize,
    exit_code: Option<i32>,
    stderr: String,
  },

  #[error("step {}: package '{package}' could not be installed: {reason}", step_index + 1)]
  DependencyInstall {
    step_index: usize,
    package: String,
    reason: String,
  },

  #[error("step {}: dependency '{dependency}' could not be installed: {reason}", step_index + 1)]
  ManifestInstall {
    step_index: usize,
    dependency: String,
    reason: String,
  },

  #[error("step {}: {path} exists and is not a directory", step_index + 1)]
  PathConflict { step_index: usize, path: String },

  #[error("{} timed out after {}", fmt_stage(*step_index), fmt_secs(*after))]
  Timeout { step_index: Option<usize>, after: Duration },

  #[error("build cancelled")]
  Cancelled,

  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error(transparent)]
  Image(#[from] ImageError),

  #[error("layer store error: {0}")]
  Layer(#[from] LayerError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl BuildError {
  /// Zero-based index of the step the error belongs to, if any.
  pub fn step_index(&self) -> Option<usize> {
    match self {
      BuildError::StepExecution { step_index, .. }
      | BuildError::DependencyInstall { step_index, .. }
      | BuildError::ManifestInstall { step_index, .. }
      | BuildError::PathConflict { step_index, .. } => Some(*step_index),
      BuildError::Timeout { step_index, .. } => *step_index,
      _ => None,
    }
  }

  /// Captured stderr of a failed command.
  pub fn stderr(&self) -> Option<&str> {
    match self {
      BuildError::StepExecution { stderr, .. } if !stderr.is_empty() => Some(stderr),
      _ => None,
    }
  }

  pub(crate) fn from_step(step_index: usize, err: StepError) -> Self {
    match err {
      StepError::Command { exit_code, stderr, .. } => BuildError::StepExecution {
        step_index,
        exit_code,
        stderr,
      },
      StepError::DependencyInstall { package, reason } => BuildError::DependencyInstall {
        step_index,
        package,
        reason,
      },
      StepError::ManifestInstall { dependency, reason } => BuildError::ManifestInstall {
        step_index,
        dependency,
        reason,
      },
      StepError::PathConflict { path } => BuildError::PathConflict { step_index, path },
      StepError::Io { path, source } => BuildError::Io { path, source },
      other @ (StepError::Spawn { .. } | StepError::CacheNotRemoved { .. } | StepError::Template(_)) => {
        BuildError::StepExecution {
          step_index,
          exit_code: None,
          stderr: other.to_string(),
        }
      }
    }
  }
}

fn fmt_code(code: Option<i32>) -> String {
  code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

fn fmt_stage(step_index: Option<usize>) -> String {
  match step_index {
    Some(i) => format!("step {}", i + 1),
    None => "base resolution".to_string(),
  }
}

fn fmt_secs(d: Duration) -> String {
  format!("{}s", d.as_secs())
}
