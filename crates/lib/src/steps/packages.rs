//! System package installation.

use tracing::{info, warn};

use super::StepError;
use super::exec::{ExecEnv, failure_reason, named_in_failure};
use super::remove_caches;
use crate::recipe::PackageTool;

/// Install `packages` with `tool`, then clear the package-index caches.
///
/// Every package is resolved before anything is installed so a missing one is
/// reported by name and nothing is half-installed.
pub async fn install_system_packages(env: &ExecEnv, packages: &[String], tool: &PackageTool) -> Result<(), StepError> {
  let base_vars = env.template_vars();

  if let Some(prepare) = &tool.prepare {
    env.run_template(prepare, &base_vars).await?;
  }

  if let Some(resolve) = &tool.resolve {
    for package in packages {
      let vars = base_vars.clone().with_package(package);
      if let Err(err) = env.run_template(resolve, &vars).await {
        let reason = failure_reason(&err);
        warn!(package = %package, reason = %reason, "package could not be resolved");
        return Err(StepError::DependencyInstall {
          package: package.clone(),
          reason,
        });
      }
    }
  }

  let vars = base_vars.clone().with_packages(packages);
  if let Err(err) = env.run_template(&tool.install, &vars).await {
    if !matches!(err, StepError::Command { .. }) {
      return Err(err);
    }
    let names: Vec<&str> = packages.iter().map(String::as_str).collect();
    let package = named_in_failure(&err, &names).map_or_else(|| packages.join(" "), str::to_string);
    let reason = failure_reason(&err);
    warn!(package = %package, reason = %reason, "package installation failed");
    return Err(StepError::DependencyInstall { package, reason });
  }

  if let Some(clean) = &tool.clean {
    env.run_template(clean, &base_vars).await?;
  }
  remove_caches(&env.rootfs, &tool.caches)?;

  info!(count = packages.len(), "system packages installed");
  Ok(())
}
