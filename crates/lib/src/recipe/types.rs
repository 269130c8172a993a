use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::placeholder::{self, PlaceholderError};

/// How the application source reaches the image.
///
/// Chosen once before the pipeline runs; see [`crate::recipe::plan_steps`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
  /// Copy the source tree into the image.
  #[default]
  Materialized,
  /// Leave the destination empty; it is bind-mounted at run time.
  ExternallyMounted,
}

impl SourceMode {
  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "materialized" | "copy" => Some(SourceMode::Materialized),
      "mounted" | "externally_mounted" | "mount" => Some(SourceMode::ExternallyMounted),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      SourceMode::Materialized => "materialized",
      SourceMode::ExternallyMounted => "mounted",
    }
  }
}

/// The default process of an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntrypointSpec {
  pub command: String,
  pub args: Vec<String>,
}

impl EntrypointSpec {
  pub fn new(command: &str, args: &[&str]) -> Self {
    Self {
      command: command.to_string(),
      args: args.iter().map(|a| a.to_string()).collect(),
    }
  }

  /// Build from an argv-style list; the first element is the command.
  pub fn from_argv(argv: Vec<String>) -> Option<Self> {
    let mut iter = argv.into_iter();
    let command = iter.next()?;
    if command.trim().is_empty() {
      return None;
    }
    Some(Self {
      command,
      args: iter.collect(),
    })
  }

  pub fn argv(&self) -> Vec<String> {
    std::iter::once(self.command.clone()).chain(self.args.iter().cloned()).collect()
  }
}

impl fmt::Display for EntrypointSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.argv().join(" "))
  }
}

/// Command templates driving the OS package manager.
///
/// `resolve` runs once per package before anything is installed so a missing
/// package is reported by name. Every path in `caches` is deleted after
/// `clean` and must be gone when the step ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageTool {
  pub prepare: Option<String>,
  pub resolve: Option<String>,
  pub install: String,
  pub clean: Option<String>,
  pub caches: Vec<String>,
}

impl PackageTool {
  pub fn apt() -> Self {
    Self {
      prepare: Some("apt-get update".to_string()),
      resolve: Some("apt-cache show $${package} > /dev/null".to_string()),
      install: "apt-get install -y --no-install-recommends $${packages}".to_string(),
      clean: Some("apt-get clean".to_string()),
      caches: vec!["/var/lib/apt/lists".to_string(), "/var/cache/apt/archives".to_string()],
    }
  }
}

impl Default for PackageTool {
  fn default() -> Self {
    Self::apt()
  }
}

/// Command templates driving the language-level dependency installer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestTool {
  pub resolve: Option<String>,
  pub install: String,
  pub caches: Vec<String>,
}

impl ManifestTool {
  pub fn pip() -> Self {
    Self {
      resolve: Some(
        "pip download --no-deps --quiet --dest /tmp/layerforge-resolve $${requirement}".to_string(),
      ),
      install: "pip install --no-cache-dir -r $${manifest}".to_string(),
      caches: vec!["/tmp/layerforge-resolve".to_string(), "/root/.cache/pip".to_string()],
    }
  }
}

impl Default for ManifestTool {
  fn default() -> Self {
    Self::pip()
  }
}

/// Pure metadata recorded in the image config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataDecl {
  Workdir(String),
  Expose(u16),
  Entrypoint(EntrypointSpec),
}

/// What a build step does, with all of its parameters.
///
/// The serialized form of this enum is part of every layer key, so field
/// changes invalidate existing caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
  EnvSet {
    vars: BTreeMap<String, String>,
  },
  PackageInstall {
    packages: Vec<String>,
    tool: PackageTool,
  },
  ManifestInstall {
    /// Path of the manifest relative to the build context.
    manifest: String,
    /// Where the manifest is placed inside the image.
    dest: String,
    tool: ManifestTool,
  },
  DirectoryCreate {
    path: String,
    persistent: bool,
  },
  FileCopy {
    /// Path relative to the build context.
    src: String,
    dest: String,
    exclude: Vec<String>,
  },
  /// A `FileCopy` planned under [`SourceMode::ExternallyMounted`].
  SourceMount {
    dest: String,
  },
  Metadata(MetadataDecl),
}

impl StepKind {
  /// Short category name used in logs and reports.
  pub fn label(&self) -> &'static str {
    match self {
      StepKind::EnvSet { .. } => "env-set",
      StepKind::PackageInstall { .. } => "package-install",
      StepKind::ManifestInstall { .. } => "manifest-install",
      StepKind::DirectoryCreate { .. } => "directory-create",
      StepKind::FileCopy { .. } | StepKind::SourceMount { .. } => "file-copy",
      StepKind::Metadata(_) => "metadata-declare",
    }
  }

  /// Whether executing the step can change the rootfs.
  pub fn changes_fs(&self) -> bool {
    match self {
      StepKind::EnvSet { .. } => false,
      StepKind::Metadata(MetadataDecl::Expose(_)) | StepKind::Metadata(MetadataDecl::Entrypoint(_)) => false,
      StepKind::Metadata(MetadataDecl::Workdir(_)) => true,
      _ => true,
    }
  }

  /// Whether the step reaches the network and runs under the network timeout.
  pub fn uses_network(&self) -> bool {
    matches!(self, StepKind::PackageInstall { .. } | StepKind::ManifestInstall { .. })
  }

  pub fn describe(&self) -> String {
    match self {
      StepKind::EnvSet { vars } => {
        let pairs: Vec<String> = vars.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("env {}", pairs.join(" "))
      }
      StepKind::PackageInstall { packages, .. } => format!("packages {}", packages.join(" ")),
      StepKind::ManifestInstall { manifest, dest, .. } => format!("install {manifest} -> {dest}"),
      StepKind::DirectoryCreate { path, persistent } => {
        if *persistent {
          format!("mkdir {path} (persistent)")
        } else {
          format!("mkdir {path}")
        }
      }
      StepKind::FileCopy { src, dest, .. } => format!("copy {src} -> {dest}"),
      StepKind::SourceMount { dest } => format!("mount point {dest}"),
      StepKind::Metadata(MetadataDecl::Workdir(path)) => format!("workdir {path}"),
      StepKind::Metadata(MetadataDecl::Expose(port)) => format!("expose {port}"),
      StepKind::Metadata(MetadataDecl::Entrypoint(spec)) => format!("entrypoint {spec}"),
    }
  }
}

/// One ordered unit of image construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
  /// Zero-based position in the recipe.
  pub index: usize,
  #[serde(flatten)]
  pub kind: StepKind,
}

/// The base snapshot a recipe starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSpec {
  pub id: String,
  pub version: String,
}

impl BaseSpec {
  /// Parse `name[:tag]`; the tag defaults to `latest`.
  pub fn parse(reference: &str) -> Result<Self, RecipeError> {
    let reference = reference.trim();
    let (id, version) = match reference.rsplit_once(':') {
      Some((id, tag)) if !tag.contains('/') => (id, tag),
      _ => (reference, "latest"),
    };

    if id.is_empty() || version.is_empty() {
      return Err(RecipeError::InvalidBase(reference.to_string()));
    }
    let valid = |s: &str| {
      s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
    };
    if !valid(id) || !valid(version) || id.split('/').any(|seg| seg.is_empty() || seg == "..") {
      return Err(RecipeError::InvalidBase(reference.to_string()));
    }

    Ok(Self {
      id: id.to_string(),
      version: version.to_string(),
    })
  }
}

impl fmt::Display for BaseSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.id, self.version)
  }
}

/// An evaluated recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
  pub name: String,
  pub base: BaseSpec,
  pub source_mode: SourceMode,
  pub steps: Vec<BuildStep>,
  /// Directory that relative `copy`/`install` sources resolve against.
  pub context_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("failed to read recipe {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("lua error: {0}")]
  Lua(String),

  #[error("recipe must return a table with a '{0}' field")]
  MissingField(&'static str),

  #[error("invalid base reference '{0}' (expected name[:tag])")]
  InvalidBase(String),

  #[error("unknown source mode '{0}' (expected 'materialized' or 'mounted')")]
  UnknownSourceMode(String),

  #[error("invalid package name '{0}'")]
  InvalidPackageName(String),

  #[error("package list of step {0} is empty")]
  EmptyPackages(usize),

  #[error("invalid port {0} (expected 1-65535)")]
  InvalidPort(i64),

  #[error("entrypoint command must not be empty")]
  EmptyEntrypoint,

  #[error("invalid environment variable name '{0}'")]
  InvalidEnvName(String),

  #[error("invalid path '{path}': {reason}")]
  InvalidPath { path: String, reason: &'static str },

  #[error(
    "manifest install (step {manifest_step}) must come before source copy (step {copy_step}) \
     so source changes do not invalidate installed dependencies"
  )]
  ManifestAfterSource { manifest_step: usize, copy_step: usize },

  #[error(
    "step {step}: the {tool} install template does not use $${{rootfs}} and would run against the host; \
     build with chroot isolation or give `tools.{tool}` templates that target $${{rootfs}}"
  )]
  HostUnsafeTool { step: usize, tool: &'static str },

  #[error("invalid {field} template: {source}")]
  InvalidTemplate {
    field: &'static str,
    #[source]
    source: PlaceholderError,
  },
}

impl From<mlua::Error> for RecipeError {
  fn from(err: mlua::Error) -> Self {
    RecipeError::Lua(err.to_string())
  }
}

/// Resolve an image path against the current workdir.
///
/// Produces an absolute `/`-separated path without `.` segments. `..` is
/// rejected rather than resolved.
pub fn normalize_image_path(workdir: &str, path: &str) -> Result<String, RecipeError> {
  if path.is_empty() {
    return Err(RecipeError::InvalidPath {
      path: path.to_string(),
      reason: "path is empty",
    });
  }

  let joined = if path.starts_with('/') {
    path.to_string()
  } else {
    format!("{}/{}", workdir.trim_end_matches('/'), path)
  };

  let mut segments = Vec::new();
  for segment in joined.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        return Err(RecipeError::InvalidPath {
          path: path.to_string(),
          reason: "'..' is not allowed in image paths",
        });
      }
      other => segments.push(other),
    }
  }

  Ok(format!("/{}", segments.join("/")))
}

/// Validate a path relative to the build context.
pub fn validate_context_path(path: &str) -> Result<(), RecipeError> {
  let p = Path::new(path);
  if p.is_absolute() {
    return Err(RecipeError::InvalidPath {
      path: path.to_string(),
      reason: "build context paths must be relative",
    });
  }
  if p.components().any(|c| matches!(c, Component::ParentDir)) {
    return Err(RecipeError::InvalidPath {
      path: path.to_string(),
      reason: "build context paths must not leave the context",
    });
  }
  Ok(())
}

pub fn validate_package_name(name: &str) -> Result<(), RecipeError> {
  let valid = !name.is_empty()
    && !name.starts_with('-')
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '_' | ':' | '=' | '-'));
  if valid {
    Ok(())
  } else {
    Err(RecipeError::InvalidPackageName(name.to_string()))
  }
}

pub fn validate_env_name(name: &str) -> Result<(), RecipeError> {
  let mut chars = name.chars();
  let valid = chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(RecipeError::InvalidEnvName(name.to_string()))
  }
}

pub fn validate_port(port: i64) -> Result<u16, RecipeError> {
  u16::try_from(port)
    .ok()
    .filter(|p| *p != 0)
    .ok_or(RecipeError::InvalidPort(port))
}

impl PackageTool {
  pub fn validate(&self) -> Result<(), RecipeError> {
    check_template("packages.prepare", self.prepare.as_deref())?;
    check_template("packages.resolve", self.resolve.as_deref())?;
    check_template("packages.install", Some(&self.install))?;
    check_template("packages.clean", self.clean.as_deref())?;
    for cache in &self.caches {
      normalize_image_path("/", cache)?;
    }
    Ok(())
  }
}

impl ManifestTool {
  pub fn validate(&self) -> Result<(), RecipeError> {
    check_template("manifest.resolve", self.resolve.as_deref())?;
    check_template("manifest.install", Some(&self.install))?;
    for cache in &self.caches {
      normalize_image_path("/", cache)?;
    }
    Ok(())
  }
}

fn check_template(field: &'static str, template: Option<&str>) -> Result<(), RecipeError> {
  match template {
    Some(t) => placeholder::validate(t).map_err(|source| RecipeError::InvalidTemplate { field, source }),
    None => Ok(()),
  }
}
