//! Image records and launch configuration.
//!
//! An [`ImageRecord`] is written only when a build reaches `Ready`. It names
//! every layer of the build so GC can keep them, and carries the runtime
//! config (environment, workdir, ports, entrypoint, persistent paths).

mod run;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use run::{RunError, RunOptions, VolumeAttach, run_image};

use crate::consts::{DEFAULT_ENTRYPOINT, DEFAULT_WORKDIR};
use crate::layer::LayerKey;
use crate::recipe::{EntrypointSpec, MetadataDecl, SourceMode, StepKind};
use crate::registry::BaseImageRef;
use crate::runtime_env::RuntimeEnvironment;
use crate::util::fs::{read_json, remove_path, write_json_atomic};

/// Runtime configuration accumulated from the build steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
  pub env: BTreeMap<String, String>,
  pub workdir: String,
  pub exposed_ports: Vec<u16>,
  /// `None` until a recipe declares one.
  pub entrypoint: Option<EntrypointSpec>,
  /// Persistent paths that may be re-mounted at run time.
  pub volumes: Vec<String>,
  /// Source destinations left empty for an external mount.
  pub mount_points: Vec<String>,
}

impl Default for ImageConfig {
  fn default() -> Self {
    Self {
      env: BTreeMap::new(),
      workdir: DEFAULT_WORKDIR.to_string(),
      exposed_ports: Vec::new(),
      entrypoint: None,
      volumes: Vec::new(),
      mount_points: Vec::new(),
    }
  }
}

impl ImageConfig {
  /// Record the metadata effect of a step.
  ///
  /// Pure: used both after executing a step and when replaying cached ones.
  pub fn apply(&mut self, step: &StepKind) {
    match step {
      StepKind::EnvSet { vars } => {
        self.env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
      }
      StepKind::DirectoryCreate { path, persistent: true } => push_unique(&mut self.volumes, path),
      StepKind::SourceMount { dest } => push_unique(&mut self.mount_points, dest),
      StepKind::Metadata(MetadataDecl::Workdir(path)) => self.workdir = path.clone(),
      StepKind::Metadata(MetadataDecl::Expose(port)) => {
        if !self.exposed_ports.contains(port) {
          self.exposed_ports.push(*port);
          self.exposed_ports.sort_unstable();
        }
      }
      StepKind::Metadata(MetadataDecl::Entrypoint(spec)) => self.entrypoint = Some(spec.clone()),
      _ => {}
    }
  }

  /// The declared entrypoint, or the interactive shell.
  pub fn effective_entrypoint(&self) -> EntrypointSpec {
    self
      .entrypoint
      .clone()
      .unwrap_or_else(|| EntrypointSpec::new(DEFAULT_ENTRYPOINT, &[]))
  }

  pub fn runtime_env(&self) -> RuntimeEnvironment {
    RuntimeEnvironment::new(self.env.clone())
  }

  /// Whether `path` may be attached at run time.
  pub fn is_attachable(&self, path: &str) -> bool {
    self.volumes.iter().chain(&self.mount_points).any(|p| p == path)
  }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
  if !list.iter().any(|v| v == value) {
    list.push(value.to_string());
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
  pub name: String,
  /// Recipe file the image was built from.
  pub recipe: PathBuf,
  pub base: BaseImageRef,
  pub base_key: LayerKey,
  /// One key per step, in order.
  pub layers: Vec<LayerKey>,
  /// Newest layer with a rootfs snapshot; `None` means the base rootfs.
  pub rootfs_layer: Option<LayerKey>,
  pub config: ImageConfig,
  pub source_mode: SourceMode,
  pub created_at_unix: u64,
}

/// What a container start needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
  pub entrypoint: EntrypointSpec,
  pub env: RuntimeEnvironment,
  pub workdir: String,
  pub exposed_ports: Vec<u16>,
}

impl ImageRecord {
  /// Resolve the process to start, honoring a run-time override.
  pub fn launch_plan(&self, entrypoint_override: Option<EntrypointSpec>) -> LaunchPlan {
    LaunchPlan {
      entrypoint: entrypoint_override.unwrap_or_else(|| self.config.effective_entrypoint()),
      env: self.config.runtime_env(),
      workdir: self.config.workdir.clone(),
      exposed_ports: self.config.exposed_ports.clone(),
    }
  }
}

#[derive(Debug, Error)]
pub enum ImageError {
  #[error("image '{0}' not found")]
  NotFound(String),

  #[error("invalid image name '{0}' (allowed: letters, digits, '.', '_', '-')")]
  InvalidName(String),

  #[error("failed to access image record {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

pub fn validate_image_name(name: &str) -> Result<(), ImageError> {
  let valid = !name.is_empty()
    && !name.starts_with('.')
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
  if valid {
    Ok(())
  } else {
    Err(ImageError::InvalidName(name.to_string()))
  }
}

/// `images/<name>.json` records.
#[derive(Debug, Clone)]
pub struct ImageStore {
  dir: PathBuf,
}

impl ImageStore {
  pub fn new(dir: PathBuf) -> Self {
    Self { dir }
  }

  fn record_path(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{name}.json"))
  }

  pub fn save(&self, record: &ImageRecord) -> Result<(), ImageError> {
    validate_image_name(&record.name)?;
    let path = self.record_path(&record.name);
    write_json_atomic(&path, record).map_err(|source| ImageError::Io { path, source })
  }

  pub fn load(&self, name: &str) -> Result<ImageRecord, ImageError> {
    validate_image_name(name)?;
    let path = self.record_path(name);
    if !path.exists() {
      return Err(ImageError::NotFound(name.to_string()));
    }
    read_json(&path).map_err(|source| ImageError::Io { path, source })
  }

  /// Every readable record, sorted by name. Unreadable files are skipped.
  pub fn list(&self) -> Result<Vec<ImageRecord>, ImageError> {
    let entries = match fs::read_dir(&self.dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => {
        return Err(ImageError::Io {
          path: self.dir.clone(),
          source,
        });
      }
    };

    let mut records: Vec<ImageRecord> = entries
      .filter_map(|e| e.ok())
      .map(|e| e.path())
      .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
      .filter_map(|p| match read_json::<ImageRecord>(&p) {
        Ok(r) => Some(r),
        Err(e) => {
          tracing::warn!(path = ?p, error = %e, "skipping unreadable image record");
          None
        }
      })
      .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
  }

  pub fn remove(&self, name: &str) -> Result<(), ImageError> {
    validate_image_name(name)?;
    let path = self.record_path(name);
    if !path.exists() {
      return Err(ImageError::NotFound(name.to_string()));
    }
    remove_path(&path).map_err(|source| ImageError::Io { path, source })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn record(name: &str) -> ImageRecord {
    let mut config = ImageConfig::default();
    config.apply(&StepKind::EnvSet {
      vars: BTreeMap::from([("PYTHONUNBUFFERED".into(), "1".into())]),
    });
    config.apply(&StepKind::Metadata(MetadataDecl::Workdir("/app".into())));
    config.apply(&StepKind::Metadata(MetadataDecl::Expose(8501)));
    ImageRecord {
      name: name.to_string(),
      recipe: PathBuf::from("/ctx/Imagefile.lua"),
      base: BaseImageRef {
        id: "python".into(),
        version: "3.10-slim".into(),
        digest: "0".repeat(64),
        rootfs: PathBuf::from("/registry/python/3.10-slim/rootfs"),
        origin: "/registry".into(),
      },
      base_key: LayerKey::from("base"),
      layers: vec![LayerKey::from("a"), LayerKey::from("b")],
      rootfs_layer: Some(LayerKey::from("a")),
      config,
      source_mode: SourceMode::Materialized,
      created_at_unix: 0,
    }
  }

  #[test]
  fn default_entrypoint_is_interactive_shell() {
    let plan = record("rag-dev").launch_plan(None);
    assert_eq!(plan.entrypoint, EntrypointSpec::new("/bin/sh", &[]));
    assert_eq!(plan.workdir, "/app");
    assert_eq!(plan.exposed_ports, vec![8501]);
    assert!(plan.env.unbuffered_output());
  }

  #[test]
  fn override_replaces_entrypoint_only() {
    let mut rec = record("rag-dev");
    rec.config.apply(&StepKind::Metadata(MetadataDecl::Entrypoint(EntrypointSpec::new("/bin/bash", &[]))));
    let plan = rec.launch_plan(Some(EntrypointSpec::new("streamlit", &["run", "app.py"])));
    assert_eq!(plan.entrypoint.argv(), vec!["streamlit", "run", "app.py"]);
    assert_eq!(plan.workdir, "/app");
    assert_eq!(rec.launch_plan(None).entrypoint.command, "/bin/bash");
  }

  #[test]
  fn last_entrypoint_wins() {
    let mut config = ImageConfig::default();
    config.apply(&StepKind::Metadata(MetadataDecl::Entrypoint(EntrypointSpec::new("/bin/sh", &[]))));
    config.apply(&StepKind::Metadata(MetadataDecl::Entrypoint(EntrypointSpec::new("/bin/bash", &["-l"]))));
    assert_eq!(config.effective_entrypoint().to_string(), "/bin/bash -l");
  }

  #[test]
  fn ports_are_deduplicated() {
    let mut config = ImageConfig::default();
    for port in [8501, 80, 8501] {
      config.apply(&StepKind::Metadata(MetadataDecl::Expose(port)));
    }
    assert_eq!(config.exposed_ports, vec![80, 8501]);
  }

  #[test]
  fn store_roundtrip_and_list() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::new(temp.path().join("images"));
    assert!(store.list().unwrap().is_empty());

    store.save(&record("zeta")).unwrap();
    store.save(&record("alpha")).unwrap();
    fs::write(temp.path().join("images/broken.json"), "{").unwrap();

    assert_eq!(store.load("alpha").unwrap(), record("alpha"));
    let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);

    store.remove("zeta").unwrap();
    assert!(matches!(store.load("zeta"), Err(ImageError::NotFound(_))));
  }

  #[test]
  fn image_names_are_validated() {
    assert!(validate_image_name("rag-dev_1.0").is_ok());
    assert!(validate_image_name("../x").is_err());
    assert!(validate_image_name(".hidden").is_err());
    assert!(validate_image_name("").is_err());
  }
}
