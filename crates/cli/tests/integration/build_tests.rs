use predicates::prelude::*;

use super::common::{TestEnv, recipe_for_base, recipe_with_packages};

#[test]
fn build_reference_recipe_reaches_ready() {
  let env = TestEnv::reference();

  env
    .build_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains("Image rag-dev is ready"))
    .stdout(predicate::str::contains("Entrypoint: /bin/sh"))
    .stdout(predicate::str::contains("Ports: 8501"));

  assert!(env.store_path().join("images/rag-dev.json").is_file());
}

#[test]
fn second_build_is_fully_cached() {
  let env = TestEnv::reference();
  env.build_cmd().assert().success();

  env
    .build_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains("Layers: 7 (7 cached)"));
}

#[test]
fn source_change_reruns_only_copy_and_later() {
  let env = TestEnv::reference();
  env.build_cmd().assert().success();

  env.write_file("ctx/app.py", "import streamlit as st\nst.title('v2')\n");

  env
    .build_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains("Layers: 7 (5 cached)"));
}

#[test]
fn build_json_output_has_steps() {
  let env = TestEnv::reference();

  let output = env.build_cmd().args(["-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(report["image"], "rag-dev");
  assert_eq!(report["state"]["state"], "ready");
  assert_eq!(report["steps"].as_array().unwrap().len(), 7);
  assert_eq!(report["record"]["config"]["exposed_ports"][0], 8501);
}

#[test]
fn unknown_package_fails_with_step_and_stderr() {
  let env = TestEnv::with_recipe(&recipe_with_packages(&["curl", "nosuchpkg"]));

  env
    .build_cmd()
    .assert()
    .failure()
    .stderr(predicate::str::contains("step 3/7 (package-install)"))
    .stderr(predicate::str::contains("nosuchpkg"))
    .stderr(predicate::str::contains("Unable to locate package"));

  assert!(!env.store_path().join("images/rag-dev.json").exists());
}

#[test]
fn unresolvable_dependency_names_it() {
  let env = TestEnv::reference();
  env.write_file("ctx/requirements.txt", "langchain==0.1.0\nnot-a-real-package==1.0\n");

  env
    .build_cmd()
    .assert()
    .failure()
    .stderr(predicate::str::contains("step 4/7 (manifest-install)"))
    .stderr(predicate::str::contains("not-a-real-package"));
}

#[test]
fn missing_base_fails_resolution() {
  let env = TestEnv::with_recipe(&recipe_for_base("python:9.9"));

  env
    .build_cmd()
    .assert()
    .failure()
    .stderr(predicate::str::contains("base resolution"))
    .stderr(predicate::str::contains("python:9.9"));
}

#[test]
fn mounted_source_mode_skips_copy() {
  let env = TestEnv::reference();

  env
    .build_cmd()
    .args(["--source-mode", "mounted"])
    .assert()
    .success()
    .stdout(predicate::str::contains("mount point /app"));
}

#[test]
fn name_override_is_used() {
  let env = TestEnv::reference();

  env.build_cmd().args(["--name", "rag-shell"]).assert().success();

  env
    .cmd()
    .arg("images")
    .assert()
    .success()
    .stdout(predicate::str::contains("rag-shell"));
}

#[test]
fn plan_reports_cached_steps_after_build() {
  let env = TestEnv::reference();

  env
    .cmd()
    .arg("plan")
    .arg(&env.recipe_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("To run: 7"));

  env.build_cmd().assert().success();

  env
    .cmd()
    .arg("plan")
    .arg(&env.recipe_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("Cached: 7"))
    .stdout(predicate::str::contains("To run: 0"));
}

#[test]
fn invalid_timeout_is_rejected() {
  let env = TestEnv::reference();

  env.build_cmd().args(["--timeout", "soon"]).assert().failure();
}

#[test]
fn host_build_with_default_tools_is_refused() {
  let env = TestEnv::with_recipe(
    r#"return {
  name = "rag-dev",
  base = "python:3.10-slim",
  setup = function(img)
    img:packages { "curl" }
  end,
}
"#,
  );

  env
    .build_cmd()
    .assert()
    .failure()
    .stderr(predicate::str::contains("Build failed at setup"))
    .stderr(predicate::str::contains("$${rootfs}"));

  assert!(!env.store_path().join("images/rag-dev.json").exists());
}
