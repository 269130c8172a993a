use anyhow::Result;
use serde::Serialize;

use layerforge_lib::platform::paths::{default_registry_dir, registry_location, store_dir};
use layerforge_lib::platform::{host_triple, is_elevated};
use layerforge_lib::steps::Isolation;

use crate::output::{OutputFormat, print_json, print_stat};

#[derive(Serialize)]
struct Info {
  version: &'static str,
  platform: String,
  store: String,
  registry: String,
  isolation: &'static str,
  elevated: bool,
}

pub fn cmd_info(output: OutputFormat) -> Result<()> {
  let info = Info {
    version: env!("CARGO_PKG_VERSION"),
    platform: host_triple(),
    store: store_dir().display().to_string(),
    registry: registry_location().unwrap_or_else(|| default_registry_dir().display().to_string()),
    isolation: Isolation::detect().as_str(),
    elevated: is_elevated(),
  };

  if output.is_json() {
    return print_json(&info);
  }

  println!("layerforge {}", info.version);
  print_stat("Platform", &info.platform);
  print_stat("Store", &info.store);
  print_stat("Registry", &info.registry);
  print_stat("Isolation", info.isolation);
  Ok(())
}
