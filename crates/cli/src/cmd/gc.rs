use std::time::Instant;

use anyhow::{Context, Result};

use layerforge_lib::gc::collect_garbage;
use layerforge_lib::platform::paths::store_dir;
use layerforge_lib::store_lock::{LockMode, StoreLock};

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_gc(dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let store = store_dir();

  let _lock = StoreLock::acquire(&store, LockMode::Exclusive, "gc").context("Failed to acquire store lock")?;

  let result = collect_garbage(&store, dry_run)?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Layers removed", &result.stats.layers_deleted.to_string());
    print_stat("Staging removed", &result.stats.staging_deleted.to_string());
    print_stat("Bases removed", &result.stats.bases_deleted.to_string());
    print_stat("Space freed", &format_bytes(result.stats.total_bytes_freed()));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
