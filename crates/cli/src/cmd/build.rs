//! Implementation of the `layerforge build` command.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use layerforge_lib::pipeline::{BuildConfig, BuildError, BuildState, CancelToken, Pipeline};
use layerforge_lib::recipe::{Recipe, evaluate_recipe};

use super::{parse_isolation, parse_source_mode};
use crate::output::{
  OutputFormat, format_duration, print_captured, print_error, print_info, print_json, print_stat, print_step,
  print_success, print_warning, truncate_hash,
};

pub struct BuildOptions {
  pub recipe: PathBuf,
  pub name: Option<String>,
  pub registry: Option<String>,
  pub isolation: Option<String>,
  pub no_cache: bool,
  pub source_mode: Option<String>,
  pub timeout: Option<Duration>,
}

/// Execute the build command.
///
/// Evaluates the recipe, runs the pipeline and prints one line per step.
/// Ctrl-C cancels the build before the next step starts.
pub fn cmd_build(opts: BuildOptions, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let recipe = evaluate_recipe(&opts.recipe)
    .with_context(|| format!("Failed to evaluate recipe: {}", opts.recipe.display()))?;

  let mut config = BuildConfig::from_env();
  if let Some(registry) = opts.registry {
    config.registry = registry;
  }
  if let Some(isolation) = parse_isolation(opts.isolation.as_deref())? {
    config.isolation = isolation;
  }
  if let Some(timeout) = opts.timeout {
    config.network_timeout = timeout;
  }
  config.no_cache = opts.no_cache;
  config.source_mode_override = parse_source_mode(opts.source_mode.as_deref())?;
  config.image_name = opts.name;
  debug!(?config, "build configuration");

  if !output.is_json() {
    print_info(&format!(
      "Building {} from {} ({} steps, {} isolation)",
      config.image_name.as_deref().unwrap_or(&recipe.name),
      recipe.base,
      recipe.steps.len(),
      config.isolation.as_str()
    ));
  }

  let cancel = CancelToken::new();
  let mut pipeline = Pipeline::new(config).with_cancel(cancel.clone());

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt.block_on(async {
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        print_warning("Interrupted, stopping after the current step");
        cancel.cancel();
      }
    });
    pipeline.build(&recipe, &opts.recipe).await
  });

  let report = match result {
    Ok(report) => report,
    Err(err) => {
      report_failure(&err, pipeline.state(), &recipe);
      return Err(err).context("Build failed");
    }
  };

  if output.is_json() {
    return print_json(&report);
  }

  println!();
  for step in &report.steps {
    let detail = if step.cached {
      "cached".to_string()
    } else {
      format_duration(step.duration)
    };
    print_step(step.index, report.steps.len(), &step.kind, &step.description, step.cached, Some(&detail));
  }
  println!();
  print_success(&format!("Image {} is ready", report.image));
  print_stat(
    "Base",
    &format!("{} ({})", report.record.base.id, truncate_hash(&report.record.base.digest)),
  );
  print_stat(
    "Layers",
    &format!("{} ({} cached)", report.steps.len(), report.cached_steps()),
  );
  print_stat("Entrypoint", &report.record.config.effective_entrypoint().to_string());
  if !report.record.config.exposed_ports.is_empty() {
    let ports: Vec<String> = report.record.config.exposed_ports.iter().map(u16::to_string).collect();
    print_stat("Ports", &ports.join(", "));
  }
  print_stat("Duration", &format_duration(start.elapsed()));

  Ok(())
}

fn report_failure(err: &BuildError, state: BuildState, recipe: &Recipe) {
  let location = match state {
    BuildState::Failed { at_step: Some(i) } => {
      let kind = recipe.steps.get(i).map(|s| s.kind.label()).unwrap_or("step");
      format!("step {}/{} ({kind})", i + 1, recipe.steps.len())
    }
    _ if matches!(err, BuildError::UnresolvedBase { .. } | BuildError::Timeout { .. }) => "base resolution".to_string(),
    _ => "setup".to_string(),
  };
  print_error(&format!("Build failed at {location}: {err}"));
  if let Some(stderr) = err.stderr() {
    print_captured(stderr);
  }
}
