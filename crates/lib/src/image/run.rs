//! Starting a process from a built image.
//!
//! Published layers are never run in place: the image rootfs is copied into a
//! fresh container directory under `tmp/`, persistent paths are attached, and
//! the entrypoint runs in the foreground with inherited stdio.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ImageRecord;
use crate::consts::SOURCE_DATE_EPOCH;
use crate::layer::{LayerError, LayerStore};
use crate::recipe::EntrypointSpec;
use crate::steps::{Isolation, directory_in_rootfs, rootfs_path};
use crate::util::fs::{copy_tree, remove_path};

#[derive(Debug, Error)]
pub enum RunError {
  #[error("invalid volume '{0}' (expected HOST:PATH)")]
  InvalidVolume(String),

  #[error("{path} is not a persistent path or mount point of this image")]
  UndeclaredVolume { path: String },

  #[error("host path {0} does not exist")]
  MissingHostPath(PathBuf),

  #[error("image rootfs {0} is missing; rebuild the image")]
  MissingRootfs(PathBuf),

  #[error(transparent)]
  Layer(#[from] LayerError),

  #[error("failed to attach {target}: {source}")]
  Mount {
    target: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to start {command}: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// A `HOST:PATH` attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAttach {
  pub host: PathBuf,
  pub target: String,
}

impl VolumeAttach {
  pub fn parse(spec: &str) -> Result<Self, RunError> {
    match spec.rsplit_once(':') {
      Some((host, target)) if !host.is_empty() && target.starts_with('/') => Ok(Self {
        host: PathBuf::from(host),
        target: target.trim_end_matches('/').to_string(),
      }),
      _ => Err(RunError::InvalidVolume(spec.to_string())),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
  pub entrypoint: Option<EntrypointSpec>,
  pub volumes: Vec<VolumeAttach>,
  pub isolation: Isolation,
  pub path: String,
  /// Keep the container directory after exit.
  pub keep: bool,
}

/// Run the image's entrypoint and return its exit code.
pub async fn run_image(store: &LayerStore, record: &ImageRecord, opts: &RunOptions) -> Result<i32, RunError> {
  for volume in &opts.volumes {
    if !record.config.is_attachable(&volume.target) {
      return Err(RunError::UndeclaredVolume {
        path: volume.target.clone(),
      });
    }
    if !volume.host.exists() {
      return Err(RunError::MissingHostPath(volume.host.clone()));
    }
  }

  let source = match &record.rootfs_layer {
    Some(key) => store.rootfs_path(key),
    None => record.base.rootfs.clone(),
  };
  if !source.is_dir() {
    return Err(RunError::MissingRootfs(source));
  }

  let tmp = store.tmp_dir();
  std::fs::create_dir_all(&tmp).map_err(|e| io_err(&tmp, e))?;
  let container = tempfile::Builder::new()
    .prefix(&format!("run-{}-", record.name))
    .tempdir_in(&tmp)
    .map_err(|e| io_err(&tmp, e))?;
  let rootfs = container.path().join("rootfs");
  copy_tree(&source, &rootfs, &[]).map_err(|e| io_err(&source, e))?;
  debug!(image = %record.name, container = ?container.path(), "container prepared");

  let mut mounted = Vec::new();
  let result = async {
    for volume in &opts.volumes {
      let target = attach(&rootfs, volume, opts.isolation)?;
      if opts.isolation == Isolation::Chroot {
        mounted.push(target);
      }
    }
    spawn(&rootfs, record, opts).await
  }
  .await;

  for target in mounted.iter().rev() {
    if let Err(e) = detach(target) {
      warn!(target = ?target, error = %e, "failed to detach volume");
    }
  }

  if opts.keep {
    let kept = container.keep();
    info!(container = ?kept, "container directory kept");
  }

  result
}

fn io_err(path: &Path, source: std::io::Error) -> RunError {
  RunError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Make `volume.host` visible at `volume.target` inside `rootfs`.
fn attach(rootfs: &Path, volume: &VolumeAttach, isolation: Isolation) -> Result<PathBuf, RunError> {
  let host = dunce::canonicalize(&volume.host).map_err(|e| io_err(&volume.host, e))?;

  let target = match isolation {
    Isolation::Host => {
      let (parent, name) = volume.target.rsplit_once('/').unwrap_or(("", volume.target.as_str()));
      let target = resolve_dir(rootfs, parent)?.join(name);
      remove_path(&target).map_err(|e| io_err(&target, e))?;
      symlink(&host, &target).map_err(|source| RunError::Mount {
        target: target.clone(),
        source,
      })?;
      target
    }
    Isolation::Chroot => {
      let target = resolve_dir(rootfs, &volume.target)?;
      bind_mount(&host, &target).map_err(|source| RunError::Mount {
        target: target.clone(),
        source,
      })?;
      target
    }
  };

  info!(host = ?host, target = %volume.target, isolation = isolation.as_str(), "volume attached");
  Ok(target)
}

/// Resolve (and create) an image directory without leaving `rootfs`.
fn resolve_dir(rootfs: &Path, image_path: &str) -> Result<PathBuf, RunError> {
  directory_in_rootfs(rootfs, image_path).map_err(|e| RunError::Mount {
    target: rootfs_path(rootfs, image_path),
    source: std::io::Error::other(e.to_string()),
  })
}

async fn spawn(rootfs: &Path, record: &ImageRecord, opts: &RunOptions) -> Result<i32, RunError> {
  let plan = record.launch_plan(opts.entrypoint.clone());
  let argv = plan.entrypoint.argv();
  info!(image = %record.name, entrypoint = %plan.entrypoint, workdir = %plan.workdir, "starting container");

  let mut command = match opts.isolation {
    Isolation::Chroot => {
      let mut c = Command::new("chroot");
      c.arg(rootfs)
        .arg("/bin/sh")
        .arg("-c")
        .arg("cd \"$0\" && exec \"$@\"")
        .arg(&plan.workdir)
        .args(&argv);
      c
    }
    Isolation::Host => {
      let mut c = Command::new(&plan.entrypoint.command);
      c.args(&plan.entrypoint.args)
        .current_dir(resolve_dir(rootfs, &plan.workdir)?);
      c
    }
  };

  command
    .env_clear()
    .env("PATH", &opts.path)
    .env("HOME", "/root")
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .stdin(Stdio::inherit())
    .stdout(Stdio::inherit())
    .stderr(Stdio::inherit());
  for (key, value) in plan.env.iter() {
    command.env(key, value);
  }
  if opts.isolation == Isolation::Host {
    command.env("ROOTFS", rootfs);
  }

  let status = command.status().await.map_err(|source| RunError::Spawn {
    command: plan.entrypoint.to_string(),
    source,
  })?;

  let code = exit_code(&status);
  info!(image = %record.name, code, "container exited");
  Ok(code)
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
  use std::os::unix::process::ExitStatusExt;
  status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
  status.code().unwrap_or(1)
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
  std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink(_original: &Path, _link: &Path) -> std::io::Result<()> {
  Err(std::io::Error::other("volumes require a unix host"))
}

#[cfg(target_os = "linux")]
fn bind_mount(source: &Path, target: &Path) -> std::io::Result<()> {
  rustix::mount::mount_bind(source, target).map_err(std::io::Error::from)
}

#[cfg(target_os = "linux")]
fn detach(target: &Path) -> std::io::Result<()> {
  rustix::mount::unmount(target, rustix::mount::UnmountFlags::DETACH).map_err(std::io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn bind_mount(_source: &Path, _target: &Path) -> std::io::Result<()> {
  Err(std::io::Error::other("bind mounts are only supported on linux"))
}

#[cfg(not(target_os = "linux"))]
fn detach(_target: &Path) -> std::io::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::DEFAULT_PATH;
  use crate::image::ImageConfig;
  use crate::layer::LayerKey;
  use crate::recipe::{MetadataDecl, SourceMode, StepKind};
  use crate::registry::BaseImageRef;
  use std::fs;
  use tempfile::TempDir;

  fn record_with_base(base_rootfs: &Path) -> ImageRecord {
    let mut config = ImageConfig::default();
    for step in [
      StepKind::EnvSet {
        vars: [("GREETING".to_string(), "hello".to_string())].into(),
      },
      StepKind::Metadata(MetadataDecl::Workdir("/app".into())),
      StepKind::DirectoryCreate {
        path: "/app/data/chroma".into(),
        persistent: true,
      },
    ] {
      config.apply(&step);
    }
    ImageRecord {
      name: "test".into(),
      recipe: PathBuf::from("/ctx/Imagefile.lua"),
      base: BaseImageRef {
        id: "debian".into(),
        version: "12".into(),
        digest: "0".repeat(64),
        rootfs: base_rootfs.to_path_buf(),
        origin: "test".into(),
      },
      base_key: LayerKey::from("base"),
      layers: vec![],
      rootfs_layer: None,
      config,
      source_mode: SourceMode::Materialized,
      created_at_unix: 0,
    }
  }

  fn opts(entrypoint: &[&str], volumes: Vec<VolumeAttach>) -> RunOptions {
    RunOptions {
      entrypoint: EntrypointSpec::from_argv(entrypoint.iter().map(|s| s.to_string()).collect()),
      volumes,
      isolation: Isolation::Host,
      path: DEFAULT_PATH.to_string(),
      keep: false,
    }
  }

  #[test]
  fn volume_parse() {
    let v = VolumeAttach::parse("./data:/app/data/chroma/").unwrap();
    assert_eq!(v.host, PathBuf::from("./data"));
    assert_eq!(v.target, "/app/data/chroma");
    assert!(VolumeAttach::parse("/app/data").is_err());
    assert!(VolumeAttach::parse("data:relative").is_err());
  }

  #[tokio::test]
  async fn runs_entrypoint_with_image_env_and_returns_code() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base");
    fs::create_dir_all(base.join("app/data/chroma")).unwrap();
    let store = LayerStore::new(temp.path().join("store"));
    let record = record_with_base(&base);

    let code = run_image(
      &store,
      &record,
      &opts(&["/bin/sh", "-c", "test \"$GREETING\" = hello && test -d data/chroma && exit 3"], vec![]),
    )
    .await
    .unwrap();
    assert_eq!(code, 3);
    assert_eq!(fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn host_volume_is_visible_and_base_untouched() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base");
    fs::create_dir_all(base.join("app/data/chroma")).unwrap();
    let host_data = temp.path().join("persist");
    fs::create_dir_all(&host_data).unwrap();
    let store = LayerStore::new(temp.path().join("store"));
    let record = record_with_base(&base);

    let volume = VolumeAttach {
      host: host_data.clone(),
      target: "/app/data/chroma".into(),
    };
    let code = run_image(
      &store,
      &record,
      &opts(&["/bin/sh", "-c", "echo stored > data/chroma/index"], vec![volume]),
    )
    .await
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(host_data.join("index")).unwrap(), "stored\n");
    assert!(!base.join("app/data/chroma/index").exists());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn linked_volume_parent_stays_in_container() {
    let temp = TempDir::new().unwrap();
    let outside = temp.path().join("outside");
    fs::create_dir_all(outside.join("chroma")).unwrap();
    let base = temp.path().join("base");
    fs::create_dir_all(base.join("app")).unwrap();
    std::os::unix::fs::symlink(&outside, base.join("app/data")).unwrap();
    let host_data = temp.path().join("persist");
    fs::create_dir_all(&host_data).unwrap();
    let store = LayerStore::new(temp.path().join("store"));
    let record = record_with_base(&base);

    let volume = VolumeAttach {
      host: host_data.clone(),
      target: "/app/data/chroma".into(),
    };
    let code = run_image(&store, &record, &opts(&["/bin/true"], vec![volume]))
      .await
      .unwrap();

    assert_eq!(code, 0);
    assert!(outside.join("chroma").is_dir());
    assert!(outside.join("chroma").symlink_metadata().unwrap().is_dir());
  }

  #[tokio::test]
  async fn undeclared_volume_is_rejected() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base");
    fs::create_dir_all(&base).unwrap();
    let store = LayerStore::new(temp.path().join("store"));
    let record = record_with_base(&base);

    let volume = VolumeAttach {
      host: temp.path().to_path_buf(),
      target: "/etc".into(),
    };
    let err = run_image(&store, &record, &opts(&["/bin/true"], vec![volume]))
      .await
      .unwrap_err();
    assert!(matches!(err, RunError::UndeclaredVolume { path } if path == "/etc"));
  }

  #[tokio::test]
  async fn missing_rootfs_is_reported() {
    let temp = TempDir::new().unwrap();
    let store = LayerStore::new(temp.path().join("store"));
    let record = record_with_base(&temp.path().join("gone"));
    let err = run_image(&store, &record, &opts(&["/bin/true"], vec![])).await.unwrap_err();
    assert!(matches!(err, RunError::MissingRootfs(_)));
  }
}
