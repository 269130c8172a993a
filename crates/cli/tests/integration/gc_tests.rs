use predicates::prelude::*;

use super::common::{TestEnv, recipe_with_packages};

#[test]
fn gc_on_empty_store_succeeds() {
  let env = TestEnv::reference();

  env
    .cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}

#[test]
fn gc_keeps_layers_of_recorded_images() {
  let env = TestEnv::reference();
  env.build_cmd().assert().success();

  env
    .cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Layers removed: 0"));

  env.build_cmd().assert().success().stdout(predicate::str::contains("(7 cached)"));
}

#[test]
fn gc_removes_layers_of_failed_builds() {
  let env = TestEnv::with_recipe(&recipe_with_packages(&["nosuchpkg"]));
  env.build_cmd().assert().failure();

  let output = env.cmd().args(["gc", "--dry-run", "-o", "json"]).output().unwrap();
  assert!(output.status.success());
  let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let planned = result["stats"]["layers_deleted"].as_u64().unwrap();
  assert_eq!(planned, 2);
  assert!(result["deleted_paths"].as_array().unwrap().len() as u64 >= planned);

  let layers = env.store_path().join("layers");
  assert_eq!(std::fs::read_dir(&layers).unwrap().count(), 2);

  env
    .cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Layers removed: 2"));
  assert_eq!(std::fs::read_dir(&layers).unwrap().count(), 0);
}
