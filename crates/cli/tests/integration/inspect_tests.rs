use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn inspect_describes_runtime_contract() {
  let env = TestEnv::reference();
  env.build_cmd().assert().success();

  env
    .cmd()
    .args(["inspect", "rag-dev"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Image: rag-dev"))
    .stdout(predicate::str::contains("Workdir: /app"))
    .stdout(predicate::str::contains("(default interactive shell)"))
    .stdout(predicate::str::contains("8501 (metadata only)"))
    .stdout(predicate::str::contains("PYTHONUNBUFFERED=1"))
    .stdout(predicate::str::contains("/app/data/chroma (persistent)"));
}

#[test]
fn inspect_json_includes_launch_plan() {
  let env = TestEnv::reference();
  env.build_cmd().assert().success();

  let output = env.cmd().args(["inspect", "rag-dev", "-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(value["record"]["name"], "rag-dev");
  assert_eq!(value["launch"]["workdir"], "/app");
  assert_eq!(value["launch"]["exposed_ports"][0], 8501);
}

#[test]
fn inspect_unknown_image_fails() {
  let env = TestEnv::reference();

  env
    .cmd()
    .args(["inspect", "nope"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("nope"));
}

#[test]
fn images_lists_built_image() {
  let env = TestEnv::reference();

  env
    .cmd()
    .arg("images")
    .assert()
    .success()
    .stdout(predicate::str::contains("No images built yet"));

  env.build_cmd().assert().success();

  let output = env.cmd().args(["images", "-o", "json"]).output().unwrap();
  assert!(output.status.success());
  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(value[0]["name"], "rag-dev");
  assert_eq!(value[0]["base"], "python:3.10-slim");
  assert_eq!(value[0]["layers"], 7);
  assert_eq!(value[0]["entrypoint"], "/bin/sh");
}
