//! Implementation of the `layerforge run` command.

use anyhow::{Context, Result};
use tracing::info;

use layerforge_lib::consts::DEFAULT_PATH;
use layerforge_lib::image::{ImageStore, RunOptions, VolumeAttach, run_image};
use layerforge_lib::layer::LayerStore;
use layerforge_lib::platform::paths::store_dir;
use layerforge_lib::recipe::EntrypointSpec;
use layerforge_lib::steps::Isolation;

use super::parse_isolation;

pub struct RunArgs {
  pub image: String,
  pub volumes: Vec<String>,
  pub isolation: Option<String>,
  pub keep: bool,
  pub command: Vec<String>,
}

/// Start the image's entrypoint and exit with its status.
pub fn cmd_run(args: RunArgs) -> Result<()> {
  let layers = LayerStore::new(store_dir());
  let images = ImageStore::new(layers.images_dir());
  let record = images
    .load(&args.image)
    .with_context(|| format!("Failed to load image: {}", args.image))?;

  let volumes = args
    .volumes
    .iter()
    .map(|v| VolumeAttach::parse(v))
    .collect::<Result<Vec<_>, _>>()?;

  let opts = RunOptions {
    entrypoint: EntrypointSpec::from_argv(args.command),
    volumes,
    isolation: parse_isolation(args.isolation.as_deref())?.unwrap_or_else(Isolation::detect),
    path: DEFAULT_PATH.to_string(),
    keep: args.keep,
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let code = rt
    .block_on(run_image(&layers, &record, &opts))
    .with_context(|| format!("Failed to run image: {}", record.name))?;

  info!(image = %record.name, code, "entrypoint exited");
  if code != 0 {
    std::process::exit(code);
  }
  Ok(())
}
