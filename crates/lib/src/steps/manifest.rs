//! Dependency installation from a flat manifest.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use super::exec::{ExecEnv, Isolation, failure_reason, named_in_failure};
use super::fs::directory_in_rootfs;
use super::{StepError, remove_caches};
use crate::util::fs::remove_path;
use crate::recipe::ManifestTool;
use crate::requirements::{Requirement, parse_requirements};

/// Install every dependency pinned in `manifest` (a host path).
///
/// The manifest is copied to `dest` inside the image first, so the installer
/// reads the same bytes the layer key was computed from.
pub async fn install_manifest_dependencies(
  env: &ExecEnv,
  manifest: &Path,
  dest: &str,
  tool: &ManifestTool,
) -> Result<Vec<Requirement>, StepError> {
  let manifest_name = manifest.display().to_string();
  let content = fs::read_to_string(manifest).map_err(|e| StepError::ManifestInstall {
    dependency: manifest_name.clone(),
    reason: format!("cannot read manifest: {e}"),
  })?;

  let requirements = parse_requirements(&content).map_err(|e| StepError::ManifestInstall {
    dependency: e.dependency,
    reason: format!("line {}: {}", e.line, e.reason),
  })?;

  let (parent, file_name) = dest.rsplit_once('/').unwrap_or(("", dest));
  if file_name.is_empty() || file_name == "." || file_name == ".." {
    return Err(StepError::PathConflict { path: dest.to_string() });
  }
  let dest_path = directory_in_rootfs(&env.rootfs, parent)?.join(file_name);
  remove_path(&dest_path).map_err(StepError::io(&dest_path))?;
  fs::copy(manifest, &dest_path).map_err(StepError::io(&dest_path))?;

  let manifest_arg = match env.isolation {
    Isolation::Chroot => dest.to_string(),
    Isolation::Host => dest_path.display().to_string(),
  };
  let base_vars = env.template_vars().with_manifest(&manifest_arg);

  if let Some(resolve) = &tool.resolve {
    for requirement in &requirements {
      let vars = base_vars.clone().with_requirement(&requirement.to_string());
      if let Err(err) = env.run_template(resolve, &vars).await {
        let reason = failure_reason(&err);
        warn!(dependency = %requirement, reason = %reason, "dependency could not be resolved");
        return Err(StepError::ManifestInstall {
          dependency: requirement.name.clone(),
          reason,
        });
      }
    }
  }

  if let Err(err) = env.run_template(&tool.install, &base_vars).await {
    if !matches!(err, StepError::Command { .. }) {
      return Err(err);
    }
    let names: Vec<&str> = requirements.iter().map(|r| r.name.as_str()).collect();
    let dependency = named_in_failure(&err, &names).map_or_else(|| dest.to_string(), str::to_string);
    let reason = failure_reason(&err);
    warn!(dependency = %dependency, reason = %reason, "manifest installation failed");
    return Err(StepError::ManifestInstall { dependency, reason });
  }
  remove_caches(&env.rootfs, &tool.caches)?;

  info!(count = requirements.len(), manifest = %dest, "manifest dependencies installed");
  Ok(requirements)
}
