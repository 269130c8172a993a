//! The build-layer pipeline.
//!
//! A build walks `Pending -> ResolvingBase -> Running{0..n} -> Ready`. Keys for
//! every step are computed up front from the resolved base; the longest prefix
//! already in the store is reused, and the remaining steps run one at a time,
//! each publishing its layer before the next starts. The first error moves
//! the build to `Failed` and nothing further is published.

mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use error::BuildError;

use crate::consts::{DEFAULT_NETWORK_TIMEOUT_SECS, DEFAULT_PATH};
use crate::image::{ImageConfig, ImageRecord, ImageStore, validate_image_name};
use crate::layer::{LayerKey, LayerStore, base_key, compute_keys};
use crate::platform::paths;
use crate::recipe::{Recipe, SourceMode, check_host_isolation, plan_steps};
use crate::registry::{BaseImageRef, Registry, resolve_base};
use crate::steps::{Isolation, StepContext, WorkingState, apply_step};
use crate::store_lock::{LockMode, StoreLock};
use crate::util::fs::copy_tree;

/// Settings for one build, independent of the recipe.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  pub store: PathBuf,
  /// Directory or `http(s)://` URL of the base registry.
  pub registry: String,
  pub network_timeout: Duration,
  pub isolation: Isolation,
  /// `PATH` exported to build commands.
  pub path: String,
  /// Skip cache lookups. Layers are still published.
  pub no_cache: bool,
  pub source_mode_override: Option<SourceMode>,
  /// Image name; defaults to the recipe's.
  pub image_name: Option<String>,
}

impl BuildConfig {
  /// Defaults from the environment (`LAYERFORGE_STORE`, `LAYERFORGE_REGISTRY`).
  pub fn from_env() -> Self {
    Self {
      store: paths::store_dir(),
      registry: paths::registry_location()
        .unwrap_or_else(|| paths::default_registry_dir().display().to_string()),
      network_timeout: Duration::from_secs(DEFAULT_NETWORK_TIMEOUT_SECS),
      isolation: Isolation::detect(),
      path: DEFAULT_PATH.to_string(),
      no_cache: false,
      source_mode_override: None,
      image_name: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
  Pending,
  ResolvingBase,
  Running { step: usize },
  Ready,
  /// `at_step = None` means base resolution failed.
  Failed { at_step: Option<usize> },
}

impl BuildState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, BuildState::Ready | BuildState::Failed { .. })
  }
}

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
  pub index: usize,
  pub kind: String,
  pub description: String,
  pub key: LayerKey,
  pub cached: bool,
  #[serde(rename = "duration_ms")]
  #[serde(serialize_with = "serialize_millis")]
  pub duration: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
  s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
  pub image: String,
  pub state: BuildState,
  pub steps: Vec<StepReport>,
  pub record: ImageRecord,
}

impl BuildReport {
  pub fn cached_steps(&self) -> usize {
    self.steps.iter().filter(|s| s.cached).count()
  }
}

/// A step as it would run, without running it.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
  pub index: usize,
  pub kind: String,
  pub description: String,
  pub key: LayerKey,
  pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
  pub image: String,
  pub base: BaseImageRef,
  pub source_mode: SourceMode,
  pub steps: Vec<PlannedStep>,
}

pub struct Pipeline {
  config: BuildConfig,
  registry: Registry,
  layers: LayerStore,
  images: ImageStore,
  cancel: CancelToken,
  state: BuildState,
}

impl Pipeline {
  pub fn new(config: BuildConfig) -> Self {
    let registry = Registry::from_location(&config.registry);
    let layers = LayerStore::new(config.store.clone());
    let images = ImageStore::new(layers.images_dir());
    Self {
      config,
      registry,
      layers,
      images,
      cancel: CancelToken::new(),
      state: BuildState::Pending,
    }
  }

  pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn state(&self) -> BuildState {
    self.state
  }

  pub fn layers(&self) -> &LayerStore {
    &self.layers
  }

  pub fn images(&self) -> &ImageStore {
    &self.images
  }

  fn transition(&mut self, next: BuildState) {
    debug!(from = ?self.state, to = ?next, "build state");
    self.state = next;
  }

  fn fail(&mut self, at_step: Option<usize>, err: BuildError) -> BuildError {
    self.transition(BuildState::Failed { at_step });
    err
  }

  fn image_name(&self, recipe: &Recipe) -> String {
    self.config.image_name.clone().unwrap_or_else(|| recipe.name.clone())
  }

  fn source_mode(&self, recipe: &Recipe) -> SourceMode {
    self.config.source_mode_override.unwrap_or(recipe.source_mode)
  }

  /// Resolve the recipe's base under the network timeout.
  async fn resolve(&self, recipe: &Recipe) -> Result<BaseImageRef, BuildError> {
    let bases_dir = self.layers.bases_dir();
    let after = self.config.network_timeout;

    match tokio::time::timeout(after, resolve_base(&self.registry, &recipe.base, &bases_dir)).await {
      Ok(Ok(base)) => Ok(base),
      Ok(Err(err)) => Err(BuildError::UnresolvedBase {
        base: recipe.base.to_string(),
        reason: err.to_string(),
      }),
      Err(_) => Err(BuildError::Timeout { step_index: None, after }),
    }
  }

  /// Resolve the base and compute keys and cache status without executing.
  pub async fn plan(&self, recipe: &Recipe) -> Result<BuildPlan, BuildError> {
    let image = self.image_name(recipe);
    validate_image_name(&image)?;
    let _lock = StoreLock::acquire(&self.config.store, LockMode::Shared, &format!("plan {image}"))?;

    let base = self.resolve(recipe).await?;
    let mode = self.source_mode(recipe);
    let steps = plan_steps(&recipe.steps, mode);
    let root = base_key(&base)?;
    let keys = compute_keys(&root, &steps, &recipe.context_dir)?;

    let mut planned = Vec::with_capacity(steps.len());
    let mut prefix_intact = !self.config.no_cache;
    for (step, key) in steps.iter().zip(&keys) {
      prefix_intact = prefix_intact && self.layers.lookup(key)?.is_some();
      planned.push(PlannedStep {
        index: step.index,
        kind: step.kind.label().to_string(),
        description: step.kind.describe(),
        key: key.clone(),
        cached: prefix_intact,
      });
    }

    Ok(BuildPlan {
      image,
      base,
      source_mode: mode,
      steps: planned,
    })
  }

  /// Run the recipe to `Ready` and publish its image record.
  pub async fn build(&mut self, recipe: &Recipe, recipe_path: &Path) -> Result<BuildReport, BuildError> {
    let image = self.image_name(recipe);
    validate_image_name(&image).map_err(|e| self.fail(None, e.into()))?;
    let _lock = StoreLock::acquire(&self.config.store, LockMode::Shared, &format!("build {image}"))
      .map_err(|e| self.fail(None, e.into()))?;

    self.transition(BuildState::ResolvingBase);
    let base = match self.resolve(recipe).await {
      Ok(base) => base,
      Err(err) => {
        warn!(base = %recipe.base, error = %err, "base resolution failed");
        return Err(self.fail(None, err));
      }
    };
    let mode = self.source_mode(recipe);
    let steps = plan_steps(&recipe.steps, mode);
    let root = base_key(&base).map_err(|e| self.fail(None, e.into()))?;
    let keys = compute_keys(&root, &steps, &recipe.context_dir).map_err(|e| self.fail(None, e.into()))?;
    let total = steps.len();

    // Longest run of verified layers from the start.
    let mut cached = Vec::new();
    if !self.config.no_cache {
      for key in &keys {
        match self.layers.lookup(key).map_err(|e| self.fail(None, e.into()))? {
          Some(layer) => cached.push(layer),
          None => break,
        }
      }
    }
    if self.config.isolation == Isolation::Host {
      check_host_isolation(&steps[cached.len()..]).map_err(|e| self.fail(None, e.into()))?;
    }
    info!(image = %image, base = %recipe.base, steps = total, cached = cached.len(), "starting build");

    let tmp = self.layers.tmp_dir();
    let work = tempfile::Builder::new()
      .prefix(&format!("build-{image}-"))
      .tempdir_in(ensure_dir(&tmp).map_err(|e| self.fail(None, e))?)
      .map_err(|source| self.fail(None, BuildError::Io { path: tmp.clone(), source }))?;
    let rootfs = work.path().join("rootfs");

    let mut rootfs_layer = cached
      .iter()
      .enumerate()
      .rev()
      .find(|(_, layer)| layer.rootfs.is_some())
      .map(|(i, _)| keys[i].clone());

    if cached.len() < total {
      match &rootfs_layer {
        Some(key) => self.layers.restore(key, &rootfs).map_err(|e| self.fail(None, e.into()))?,
        None => {
          copy_tree(&base.rootfs, &rootfs, &[]).map_err(|source| {
            self.fail(
              None,
              BuildError::Io {
                path: base.rootfs.clone(),
                source,
              },
            )
          })?;
        }
      }
    }

    let mut state = WorkingState {
      rootfs,
      config: ImageConfig::default(),
    };
    let mut reports = Vec::with_capacity(total);

    for (step, key) in steps.iter().zip(&keys).take(cached.len()) {
      state.config.apply(&step.kind);
      reports.push(StepReport {
        index: step.index,
        kind: step.kind.label().to_string(),
        description: step.kind.describe(),
        key: key.clone(),
        cached: true,
        duration: Duration::ZERO,
      });
      info!(step = step.index + 1, total, key = %key, kind = step.kind.label(), "using cached layer");
    }

    let ctx = StepContext {
      context_dir: recipe.context_dir.clone(),
      isolation: self.config.isolation,
      path: self.config.path.clone(),
    };

    for (step, key) in steps.iter().zip(&keys).skip(cached.len()) {
      if self.cancel.is_cancelled() {
        warn!(step = step.index + 1, "build cancelled");
        return Err(self.fail(Some(step.index), BuildError::Cancelled));
      }
      self.transition(BuildState::Running { step: step.index });
      info!(step = step.index + 1, total, kind = step.kind.label(), "{}", step.kind.describe());

      let started = Instant::now();
      let result = if step.kind.uses_network() {
        let after = self.config.network_timeout;
        match tokio::time::timeout(after, apply_step(&ctx, step, &mut state)).await {
          Ok(r) => r.map_err(|e| BuildError::from_step(step.index, e)),
          Err(_) => Err(BuildError::Timeout {
            step_index: Some(step.index),
            after,
          }),
        }
      } else {
        apply_step(&ctx, step, &mut state)
          .await
          .map_err(|e| BuildError::from_step(step.index, e))
      };
      if let Err(err) = result {
        warn!(step = step.index + 1, error = %err, "step failed");
        return Err(self.fail(Some(step.index), err));
      }

      let parent = if step.index == 0 { &root } else { &keys[step.index - 1] };
      let snapshot = step.kind.changes_fs().then_some(state.rootfs.as_path());
      self
        .layers
        .publish(key, parent, step.index, &step.kind, snapshot)
        .map_err(|e| self.fail(Some(step.index), e.into()))?;
      if snapshot.is_some() {
        rootfs_layer = Some(key.clone());
      }

      reports.push(StepReport {
        index: step.index,
        kind: step.kind.label().to_string(),
        description: step.kind.describe(),
        key: key.clone(),
        cached: false,
        duration: started.elapsed(),
      });
    }

    let record = ImageRecord {
      name: image.clone(),
      recipe: recipe_path.to_path_buf(),
      base,
      base_key: root,
      layers: keys,
      rootfs_layer,
      config: state.config,
      source_mode: mode,
      created_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    self.images.save(&record).map_err(|e| self.fail(None, e.into()))?;
    self.transition(BuildState::Ready);
    info!(image = %image, layers = record.layers.len(), "image ready");

    Ok(BuildReport {
      image,
      state: self.state,
      steps: reports,
      record,
    })
  }
}

fn ensure_dir(path: &Path) -> Result<&Path, BuildError> {
  std::fs::create_dir_all(path).map_err(|source| BuildError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(path)
}
