//! Implementation of the `layerforge images` command.

use anyhow::{Context, Result};
use serde::Serialize;

use layerforge_lib::image::ImageStore;
use layerforge_lib::layer::LayerStore;
use layerforge_lib::platform::paths::store_dir;

use crate::output::{OutputFormat, print_info, print_json, truncate_hash};

#[derive(Serialize)]
struct ImageSummary {
  name: String,
  base: String,
  layers: usize,
  entrypoint: String,
  created_at_unix: u64,
}

pub fn cmd_images(output: OutputFormat) -> Result<()> {
  let layers = LayerStore::new(store_dir());
  let records = ImageStore::new(layers.images_dir())
    .list()
    .context("Failed to list images")?;

  let summaries: Vec<ImageSummary> = records
    .iter()
    .map(|r| ImageSummary {
      name: r.name.clone(),
      base: format!("{}:{}", r.base.id, r.base.version),
      layers: r.layers.len(),
      entrypoint: r.config.effective_entrypoint().to_string(),
      created_at_unix: r.created_at_unix,
    })
    .collect();

  if output.is_json() {
    return print_json(&summaries);
  }

  if summaries.is_empty() {
    print_info("No images built yet");
    return Ok(());
  }

  println!("{:<24} {:<24} {:>6}  {:<14} ENTRYPOINT", "NAME", "BASE", "LAYERS", "ROOTFS");
  for (summary, record) in summaries.iter().zip(&records) {
    let rootfs = record
      .rootfs_layer
      .as_ref()
      .map(|k| truncate_hash(&k.0).to_string())
      .unwrap_or_else(|| "base".to_string());
    println!(
      "{:<24} {:<24} {:>6}  {:<14} {}",
      summary.name, summary.base, summary.layers, rootfs, summary.entrypoint
    );
  }

  Ok(())
}
