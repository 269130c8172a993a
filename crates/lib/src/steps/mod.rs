//! Step executors.
//!
//! [`apply_step`] takes the state left by the previous step (working rootfs
//! plus accumulated image config) and produces the next one. Failures are
//! reported as [`StepError`] and mapped to build errors by the pipeline.

pub mod exec;
pub mod fs;
pub mod manifest;
pub mod packages;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub use exec::{ExecEnv, Isolation};
pub use fs::{directory_in_rootfs, ensure_directory, existing_in_rootfs, materialize_source, rootfs_path};
pub use manifest::install_manifest_dependencies;
pub use packages::install_system_packages;

use crate::image::ImageConfig;
use crate::placeholder::PlaceholderError;
use crate::recipe::{BuildStep, MetadataDecl, StepKind};
use crate::util::fs::remove_path;

#[derive(Debug, Error)]
pub enum StepError {
  #[error("command failed (exit code {exit_code:?}): {cmd}")]
  Command {
    cmd: String,
    exit_code: Option<i32>,
    stderr: String,
  },

  #[error("failed to spawn '{cmd}': {source}")]
  Spawn {
    cmd: String,
    #[source]
    source: std::io::Error,
  },

  #[error("package '{package}' could not be installed: {reason}")]
  DependencyInstall { package: String, reason: String },

  #[error("dependency '{dependency}' could not be installed: {reason}")]
  ManifestInstall { dependency: String, reason: String },

  #[error("path {path} exists and is not a directory")]
  PathConflict { path: String },

  #[error("cache path {path} still present after cleanup")]
  CacheNotRemoved { path: String },

  #[error(transparent)]
  Template(#[from] PlaceholderError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl StepError {
  pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
    move |source| StepError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Fixed inputs shared by every step of one build.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub context_dir: PathBuf,
  pub isolation: Isolation,
  pub path: String,
}

/// What one step leaves for the next.
#[derive(Debug, Clone)]
pub struct WorkingState {
  pub rootfs: PathBuf,
  pub config: ImageConfig,
}

impl WorkingState {
  fn exec_env(&self, ctx: &StepContext) -> ExecEnv {
    ExecEnv {
      rootfs: self.rootfs.clone(),
      isolation: ctx.isolation,
      path: ctx.path.clone(),
      vars: self.config.env.clone(),
    }
  }
}

/// Run one step against `state`, updating it in place.
pub async fn apply_step(ctx: &StepContext, step: &BuildStep, state: &mut WorkingState) -> Result<(), StepError> {
  debug!(step = step.index, kind = step.kind.label(), "applying step");

  match &step.kind {
    StepKind::EnvSet { .. } => {}
    StepKind::PackageInstall { packages, tool } => {
      install_system_packages(&state.exec_env(ctx), packages, tool).await?;
    }
    StepKind::ManifestInstall { manifest, dest, tool } => {
      let host_manifest = ctx.context_dir.join(manifest);
      install_manifest_dependencies(&state.exec_env(ctx), &host_manifest, dest, tool).await?;
    }
    StepKind::DirectoryCreate { path, .. } => {
      ensure_directory(&state.rootfs, path)?;
    }
    StepKind::FileCopy { src, dest, exclude } => {
      materialize_source(&ctx.context_dir.join(src), &state.rootfs, dest, exclude)?;
    }
    StepKind::SourceMount { dest } => {
      ensure_directory(&state.rootfs, dest)?;
    }
    StepKind::Metadata(MetadataDecl::Workdir(path)) => {
      ensure_directory(&state.rootfs, path)?;
    }
    StepKind::Metadata(_) => {}
  }

  state.config.apply(&step.kind);
  Ok(())
}

/// Delete cache paths inside `rootfs` and confirm they are gone.
pub fn remove_caches(rootfs: &Path, caches: &[String]) -> Result<(), StepError> {
  for cache in caches {
    let Some(path) = existing_in_rootfs(rootfs, cache)? else {
      debug!(path = %cache, "cache absent");
      continue;
    };
    remove_path(&path).map_err(StepError::io(&path))?;
    if path.symlink_metadata().is_ok() {
      return Err(StepError::CacheNotRemoved { path: cache.clone() });
    }
    debug!(path = %cache, "cache removed");
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::DEFAULT_PATH;
  use std::collections::BTreeMap;
  use std::fs as stdfs;
  use tempfile::TempDir;

  fn setup() -> (TempDir, StepContext, WorkingState) {
    let temp = TempDir::new().unwrap();
    let context_dir = temp.path().join("ctx");
    let rootfs = temp.path().join("rootfs");
    stdfs::create_dir_all(&context_dir).unwrap();
    stdfs::create_dir_all(&rootfs).unwrap();
    stdfs::write(context_dir.join("app.py"), "print('rag')").unwrap();
    let ctx = StepContext {
      context_dir,
      isolation: Isolation::Host,
      path: DEFAULT_PATH.to_string(),
    };
    let state = WorkingState {
      rootfs,
      config: ImageConfig::default(),
    };
    (temp, ctx, state)
  }

  fn step(index: usize, kind: StepKind) -> BuildStep {
    BuildStep { index, kind }
  }

  #[tokio::test]
  async fn env_then_metadata_updates_config() {
    let (_temp, ctx, mut state) = setup();
    let vars = BTreeMap::from([("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]);
    apply_step(&ctx, &step(0, StepKind::EnvSet { vars }), &mut state).await.unwrap();
    apply_step(&ctx, &step(1, StepKind::Metadata(MetadataDecl::Expose(8501))), &mut state)
      .await
      .unwrap();

    assert_eq!(state.config.env.get("DEBIAN_FRONTEND").map(String::as_str), Some("noninteractive"));
    assert_eq!(state.config.exposed_ports, vec![8501]);
    assert_eq!(stdfs::read_dir(&state.rootfs).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn copy_and_mount_modes() {
    let (_temp, ctx, mut state) = setup();
    apply_step(
      &ctx,
      &step(
        0,
        StepKind::FileCopy {
          src: ".".into(),
          dest: "/app".into(),
          exclude: vec![],
        },
      ),
      &mut state,
    )
    .await
    .unwrap();
    assert!(state.rootfs.join("app/app.py").is_file());

    apply_step(&ctx, &step(1, StepKind::SourceMount { dest: "/src".into() }), &mut state)
      .await
      .unwrap();
    assert!(state.rootfs.join("src").is_dir());
    assert_eq!(stdfs::read_dir(state.rootfs.join("src")).unwrap().count(), 0);
    assert_eq!(state.config.mount_points, vec!["/src".to_string()]);
  }

  #[tokio::test]
  async fn persistent_directory_is_a_volume() {
    let (_temp, ctx, mut state) = setup();
    let mkdir = step(
      0,
      StepKind::DirectoryCreate {
        path: "/app/data/chroma".into(),
        persistent: true,
      },
    );
    apply_step(&ctx, &mkdir, &mut state).await.unwrap();
    apply_step(&ctx, &mkdir, &mut state).await.unwrap();
    assert!(state.rootfs.join("app/data/chroma").is_dir());
    assert_eq!(state.config.volumes, vec!["/app/data/chroma".to_string()]);
  }

  #[test]
  fn remove_caches_deletes_paths() {
    let temp = TempDir::new().unwrap();
    stdfs::create_dir_all(temp.path().join("var/lib/apt/lists/partial")).unwrap();
    stdfs::write(temp.path().join("var/lib/apt/lists/index"), "x").unwrap();

    remove_caches(
      temp.path(),
      &["/var/lib/apt/lists".to_string(), "/var/cache/apt/archives".to_string()],
    )
    .unwrap();
    assert!(!temp.path().join("var/lib/apt/lists").exists());
    assert!(temp.path().join("var/lib/apt").is_dir());
  }

  #[cfg(unix)]
  #[test]
  fn remove_caches_never_follows_links_out_of_rootfs() {
    let temp = TempDir::new().unwrap();
    let rootfs = temp.path().join("rootfs");
    let host_cache = temp.path().join("host-cache");
    stdfs::create_dir_all(rootfs.join("var")).unwrap();
    stdfs::create_dir_all(host_cache.join("apt")).unwrap();
    std::os::unix::fs::symlink(&host_cache, rootfs.join("var/cache")).unwrap();

    remove_caches(&rootfs, &["/var/cache/apt".to_string()]).unwrap();
    assert!(host_cache.join("apt").is_dir());
  }
}
