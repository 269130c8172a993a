//! Implementation of the `layerforge plan` command.
//!
//! Resolves the recipe's base and computes every layer key without running any
//! step, reporting which steps the next build would take from the cache.

use std::path::Path;

use anyhow::{Context, Result};

use layerforge_lib::pipeline::{BuildConfig, Pipeline};
use layerforge_lib::recipe::evaluate_recipe;

use super::parse_source_mode;
use crate::output::{OutputFormat, print_json, print_stat, print_step, truncate_hash};

pub fn cmd_plan(recipe_path: &Path, registry: Option<String>, source_mode: Option<String>, output: OutputFormat) -> Result<()> {
  let recipe = evaluate_recipe(recipe_path)
    .with_context(|| format!("Failed to evaluate recipe: {}", recipe_path.display()))?;

  let mut config = BuildConfig::from_env();
  if let Some(registry) = registry {
    config.registry = registry;
  }
  config.source_mode_override = parse_source_mode(source_mode.as_deref())?;

  let pipeline = Pipeline::new(config);
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let plan = rt.block_on(pipeline.plan(&recipe)).context("Plan failed")?;

  if output.is_json() {
    return print_json(&plan);
  }

  let cached = plan.steps.iter().filter(|s| s.cached).count();
  println!("Plan: {}", plan.image);
  print_stat(
    "Base",
    &format!("{}:{} ({})", plan.base.id, plan.base.version, truncate_hash(&plan.base.digest)),
  );
  print_stat("Source", plan.source_mode.as_str());
  println!();
  for step in &plan.steps {
    print_step(
      step.index,
      plan.steps.len(),
      &step.kind,
      &step.description,
      step.cached,
      Some(truncate_hash(&step.key.0)),
    );
  }
  println!();
  print_stat("Cached", &cached.to_string());
  print_stat("To run", &(plan.steps.len() - cached).to_string());

  Ok(())
}
