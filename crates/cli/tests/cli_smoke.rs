//! CLI smoke tests for layerforge.
//!
//! These tests verify that every command parses its arguments and fails
//! cleanly on bad input.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

fn layerforge_cmd() -> Command {
  cargo_bin_cmd!("layerforge")
}

/// Command bound to an empty store.
fn isolated_cmd(temp: &TempDir) -> Command {
  let mut cmd = layerforge_cmd();
  cmd.env("LAYERFORGE_STORE", temp.path().join("store"));
  cmd.env("LAYERFORGE_REGISTRY", temp.path().join("registry"));
  cmd.env_remove("RUST_LOG");
  cmd
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  layerforge_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  layerforge_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("layerforge"));
}

#[test]
fn subcommand_help_works() {
  for sub in ["build", "plan", "inspect", "run", "images", "gc", "info"] {
    layerforge_cmd().args([sub, "--help"]).assert().success();
  }
}

#[test]
fn unknown_subcommand_fails() {
  layerforge_cmd().arg("push").assert().failure();
}

// =============================================================================
// Commands against an empty store
// =============================================================================

#[test]
#[serial]
fn build_missing_recipe_fails() {
  let temp = TempDir::new().unwrap();

  isolated_cmd(&temp)
    .args(["build", "does-not-exist.lua"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to evaluate recipe"));
}

#[test]
#[serial]
fn build_rejects_unknown_isolation() {
  let temp = TempDir::new().unwrap();
  std::fs::write(
    temp.path().join("Imagefile.lua"),
    "return { name = \"x\", base = \"python:3.10-slim\", setup = function(_) end }",
  )
  .unwrap();

  isolated_cmd(&temp)
    .arg("build")
    .arg(temp.path().join("Imagefile.lua"))
    .args(["--isolation", "vm"])
    .assert()
    .failure();
}

#[test]
#[serial]
fn info_works() {
  let temp = TempDir::new().unwrap();

  isolated_cmd(&temp)
    .arg("info")
    .assert()
    .success()
    .stdout(predicate::str::contains("Store"));
}

#[test]
#[serial]
fn info_json_works() {
  let temp = TempDir::new().unwrap();

  let output = isolated_cmd(&temp).args(["info", "-o", "json"]).output().unwrap();
  assert!(output.status.success());
  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert!(value["version"].is_string());
}

#[test]
#[serial]
fn images_empty_store() {
  let temp = TempDir::new().unwrap();

  isolated_cmd(&temp).arg("images").assert().success();
}

#[test]
#[serial]
fn gc_dry_run_empty_store() {
  let temp = TempDir::new().unwrap();

  isolated_cmd(&temp)
    .args(["gc", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));
}
