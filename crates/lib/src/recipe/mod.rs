//! Recipe evaluation, validation and planning.

mod lua;
mod types;

use std::path::{Path, PathBuf};

use tracing::warn;

pub use lua::{RawStep, RecipeCtx, evaluate_recipe, evaluate_recipe_source};
pub use types::*;

use crate::consts::{DEFAULT_COPY_EXCLUDES, DEFAULT_WORKDIR};
use crate::placeholder::{self, Placeholder, Segment};

/// Turn recorded declarations into validated, indexed build steps.
///
/// Walks the declarations in order while tracking the current workdir so
/// relative image paths resolve against the workdir in effect at that point.
pub fn finalize(
  name: String,
  base: BaseSpec,
  source_mode: SourceMode,
  package_tool: &PackageTool,
  manifest_tool: &ManifestTool,
  raw: Vec<RawStep>,
  context_dir: PathBuf,
) -> Result<Recipe, RecipeError> {
  package_tool.validate()?;
  manifest_tool.validate()?;

  let mut workdir = DEFAULT_WORKDIR.to_string();
  let mut steps = Vec::with_capacity(raw.len());
  let mut first_copy: Option<usize> = None;
  let mut entrypoints = 0usize;

  for (index, decl) in raw.into_iter().enumerate() {
    let kind = match decl {
      RawStep::Env(vars) => {
        for key in vars.keys() {
          validate_env_name(key)?;
        }
        StepKind::EnvSet { vars }
      }
      RawStep::Workdir(path) => {
        workdir = normalize_image_path(&workdir, &path)?;
        StepKind::Metadata(MetadataDecl::Workdir(workdir.clone()))
      }
      RawStep::Packages(packages) => {
        if packages.is_empty() {
          return Err(RecipeError::EmptyPackages(index));
        }
        for package in &packages {
          validate_package_name(package)?;
        }
        StepKind::PackageInstall {
          packages,
          tool: package_tool.clone(),
        }
      }
      RawStep::Install { manifest, dest } => {
        if let Some(copy_step) = first_copy {
          return Err(RecipeError::ManifestAfterSource {
            manifest_step: index,
            copy_step,
          });
        }
        validate_context_path(&manifest)?;
        let dest = match dest {
          Some(d) => normalize_image_path(&workdir, &d)?,
          None => {
            let file_name = Path::new(&manifest)
              .file_name()
              .map(|n| n.to_string_lossy().to_string())
              .ok_or_else(|| RecipeError::InvalidPath {
                path: manifest.clone(),
                reason: "manifest path has no file name",
              })?;
            normalize_image_path(&workdir, &file_name)?
          }
        };
        StepKind::ManifestInstall {
          manifest,
          dest,
          tool: manifest_tool.clone(),
        }
      }
      RawStep::Mkdir { path, persistent } => StepKind::DirectoryCreate {
        path: normalize_image_path(&workdir, &path)?,
        persistent,
      },
      RawStep::Copy { src, dest, exclude } => {
        validate_context_path(&src)?;
        first_copy.get_or_insert(index);
        StepKind::FileCopy {
          src,
          dest: normalize_image_path(&workdir, &dest)?,
          exclude: exclude.unwrap_or_else(|| DEFAULT_COPY_EXCLUDES.iter().map(|s| s.to_string()).collect()),
        }
      }
      RawStep::Expose(port) => StepKind::Metadata(MetadataDecl::Expose(validate_port(port)?)),
      RawStep::Entrypoint(argv) => {
        let spec = EntrypointSpec::from_argv(argv).ok_or(RecipeError::EmptyEntrypoint)?;
        entrypoints += 1;
        StepKind::Metadata(MetadataDecl::Entrypoint(spec))
      }
    };
    steps.push(BuildStep { index, kind });
  }

  if entrypoints > 1 {
    warn!(
      image = %name,
      count = entrypoints,
      "multiple entrypoints declared, the last one wins"
    );
  }

  Ok(Recipe {
    name,
    base,
    source_mode,
    steps,
    context_dir,
  })
}

/// Resolve the source mode into the concrete step list the pipeline runs.
///
/// Under [`SourceMode::ExternallyMounted`] every `FileCopy` becomes a
/// `SourceMount` that only creates and registers the mount point.
pub fn plan_steps(steps: &[BuildStep], mode: SourceMode) -> Vec<BuildStep> {
  steps
    .iter()
    .map(|step| match (&step.kind, mode) {
      (StepKind::FileCopy { dest, .. }, SourceMode::ExternallyMounted) => BuildStep {
        index: step.index,
        kind: StepKind::SourceMount { dest: dest.clone() },
      },
      _ => step.clone(),
    })
    .collect()
}

/// Refuse install templates that cannot reach the image under host isolation.
///
/// Without a chroot, a command only touches the working rootfs through
/// `$${rootfs}`; an install template without it would modify the host.
pub fn check_host_isolation(steps: &[BuildStep]) -> Result<(), RecipeError> {
  for step in steps {
    let (tool, install) = match &step.kind {
      StepKind::PackageInstall { tool, .. } => ("packages", &tool.install),
      StepKind::ManifestInstall { tool, .. } => ("manifest", &tool.install),
      _ => continue,
    };
    let segments =
      placeholder::parse(install).map_err(|source| RecipeError::InvalidTemplate { field: "install", source })?;
    if !segments.iter().any(|s| matches!(s, Segment::Placeholder(Placeholder::Rootfs))) {
      return Err(RecipeError::HostUnsafeTool {
        step: step.index + 1,
        tool,
      });
    }
  }
  Ok(())
}
