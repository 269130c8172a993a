//! Implementation of the `layerforge inspect` command.

use anyhow::{Context, Result};
use serde::Serialize;

use layerforge_lib::image::{ImageRecord, ImageStore, LaunchPlan};
use layerforge_lib::layer::LayerStore;
use layerforge_lib::platform::paths::store_dir;
use layerforge_lib::runtime_env::RECOGNIZED;

use crate::output::{OutputFormat, print_json, print_stat, symbols, truncate_hash};

#[derive(Serialize)]
struct Inspection<'a> {
  record: &'a ImageRecord,
  launch: LaunchPlan,
}

pub fn cmd_inspect(name: &str, output: OutputFormat) -> Result<()> {
  let layers = LayerStore::new(store_dir());
  let images = ImageStore::new(layers.images_dir());
  let record = images.load(name).with_context(|| format!("Failed to load image: {name}"))?;
  let launch = record.launch_plan(None);

  if output.is_json() {
    return print_json(&Inspection {
      record: &record,
      launch,
    });
  }

  println!("Image: {}", record.name);
  print_stat("Recipe", &record.recipe.display().to_string());
  print_stat(
    "Base",
    &format!("{}:{} ({})", record.base.id, record.base.version, truncate_hash(&record.base.digest)),
  );
  print_stat("Source", record.source_mode.as_str());
  print_stat("Layers", &record.layers.len().to_string());
  print_stat("Workdir", &launch.workdir);
  let default_note = if record.config.entrypoint.is_none() {
    " (default interactive shell)"
  } else {
    ""
  };
  print_stat("Entrypoint", &format!("{}{default_note}", launch.entrypoint));

  if !launch.exposed_ports.is_empty() {
    let ports: Vec<String> = launch.exposed_ports.iter().map(u16::to_string).collect();
    print_stat("Ports", &format!("{} (metadata only)", ports.join(", ")));
  }

  if !launch.env.is_empty() {
    println!();
    println!("Environment:");
    for (key, value) in launch.env.iter() {
      let note = RECOGNIZED
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, what)| format!("  # {what}"))
        .unwrap_or_default();
      println!("  {key}={value}{note}");
    }
  }

  if !record.config.volumes.is_empty() || !record.config.mount_points.is_empty() {
    println!();
    println!("Attachable paths:");
    for path in &record.config.volumes {
      println!("  {} {path} (persistent)", symbols::ARROW);
    }
    for path in &record.config.mount_points {
      println!("  {} {path} (source mount)", symbols::ARROW);
    }
  }

  Ok(())
}
