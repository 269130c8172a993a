use predicates::prelude::*;

use super::common::TestEnv;

fn built() -> TestEnv {
  let env = TestEnv::reference();
  env.build_cmd().assert().success();
  env
}

#[test]
fn run_command_sees_image_env_and_workdir() {
  let env = built();

  env
    .cmd()
    .args(["run", "rag-dev", "--isolation", "host", "--"])
    .args(["/bin/sh", "-c", "echo unbuffered=$PYTHONUNBUFFERED; ls"])
    .assert()
    .success()
    .stdout(predicate::str::contains("unbuffered=1"))
    .stdout(predicate::str::contains("app.py"))
    .stdout(predicate::str::contains("requirements.txt"));
}

#[test]
fn default_entrypoint_is_interactive_shell() {
  let env = built();

  // stdin is closed, so the shell exits right away
  env
    .cmd()
    .args(["run", "rag-dev", "--isolation", "host"])
    .write_stdin("")
    .assert()
    .success();
}

#[test]
fn exit_code_is_propagated() {
  let env = built();

  env
    .cmd()
    .args(["run", "rag-dev", "--isolation", "host", "--", "/bin/sh", "-c", "exit 3"])
    .assert()
    .code(3);
}

#[test]
fn persistent_path_accepts_volume() {
  let env = built();
  let data = env.data_path();

  env
    .cmd()
    .args(["run", "rag-dev", "--isolation", "host", "-V"])
    .arg(format!("{}:/app/data/chroma", data.display()))
    .args(["--", "/bin/sh", "-c", "echo indexed > data/chroma/marker"])
    .assert()
    .success();

  assert_eq!(std::fs::read_to_string(data.join("marker")).unwrap().trim(), "indexed");
}

#[test]
fn undeclared_volume_is_rejected() {
  let env = built();
  let data = env.data_path();

  env
    .cmd()
    .args(["run", "rag-dev", "--isolation", "host", "-V"])
    .arg(format!("{}:/etc", data.display()))
    .args(["--", "/bin/true"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("/etc"));
}

#[test]
fn run_unknown_image_fails() {
  let env = TestEnv::reference();

  env
    .cmd()
    .args(["run", "missing", "--isolation", "host", "--", "/bin/true"])
    .assert()
    .failure();
}
