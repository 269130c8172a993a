//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Package and manifest tools that only touch files under the rootfs.
///
/// `nosuchpkg` and `not-a-real-package` fail to resolve.
pub const FAKE_TOOLS: &str = r#"{
    packages = {
      prepare = [[mkdir -p "$${rootfs}/var/lib/apt/lists"]],
      resolve = [[case "$${package}" in nosuchpkg) echo "E: Unable to locate package $${package}" >&2; exit 100;; esac]],
      install = [[mkdir -p "$${rootfs}/var/lib/dpkg" && echo $${packages} >> "$${rootfs}/var/lib/dpkg/installed"]],
      clean = [[true]],
      caches = { "/var/lib/apt/lists" },
    },
    manifest = {
      resolve = [[case "$${requirement}" in not-a-real-package*) echo "ERROR: No matching distribution found for $${requirement}" >&2; exit 1;; esac]],
      install = [[mkdir -p "$${rootfs}/usr/lib/python3/site-packages" && cat "$${manifest}" >> "$${rootfs}/usr/lib/python3/site-packages/installed.txt"]],
      caches = {},
    },
  }"#;

pub const REQUIREMENTS: &str = "langchain==0.1.0\nchromadb==0.4.22\nstreamlit==1.31.0\n";

/// The reference development image with fake tools.
pub fn reference_recipe() -> String {
  recipe_with_packages(&["build-essential", "git", "curl", "poppler-utils", "libgl1"])
}

pub fn recipe_with_packages(packages: &[&str]) -> String {
  recipe("python:3.10-slim", packages)
}

/// The reference recipe on another base.
pub fn recipe_for_base(base: &str) -> String {
  recipe(base, &["build-essential", "git", "curl", "poppler-utils", "libgl1"])
}

fn recipe(base: &str, packages: &[&str]) -> String {
  let packages: Vec<String> = packages.iter().map(|p| format!("{p:?}")).collect();
  format!(
    r#"return {{
  name = "rag-dev",
  base = "{base}",
  tools = {FAKE_TOOLS},
  setup = function(img)
    img:env {{ DEBIAN_FRONTEND = "noninteractive", PYTHONUNBUFFERED = "1", PYTHONDONTWRITEBYTECODE = "1" }}
    img:workdir "/app"
    img:packages {{ {} }}
    img:install "requirements.txt"
    img:mkdir("data/chroma", {{ persistent = true }})
    img:copy(".", ".")
    img:expose(8501)
  end,
}}
"#,
    packages.join(", ")
  )
}

/// Isolated test environment.
///
/// Each test gets its own registry (with a `python:3.10-slim` base), store,
/// data directory and build context.
pub struct TestEnv {
  pub temp: TempDir,
  pub recipe_path: PathBuf,
}

impl TestEnv {
  /// Create a context holding `recipe`, the reference requirements and sources.
  pub fn with_recipe(recipe: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let env = Self {
      recipe_path: temp.path().join("ctx").join("Imagefile.lua"),
      temp,
    };
    env.write_file("ctx/Imagefile.lua", recipe);
    env.write_file("ctx/requirements.txt", REQUIREMENTS);
    env.write_file("ctx/app.py", "import streamlit as st\n");
    env.write_file("ctx/rag/index.py", "def build_index():\n    pass\n");
    env.write_file("registry/python/3.10-slim/rootfs/etc/os-release", "ID=debian\n");
    std::fs::create_dir_all(env.temp.path().join("registry/python/3.10-slim/rootfs/tmp")).unwrap();
    env
  }

  pub fn reference() -> Self {
    Self::with_recipe(&reference_recipe())
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn store_path(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  pub fn registry_path(&self) -> PathBuf {
    self.temp.path().join("registry")
  }

  pub fn data_path(&self) -> PathBuf {
    let p = self.temp.path().join("data");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Get a pre-configured Command for the layerforge binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `LAYERFORGE_STORE`: Isolated store
  /// - `LAYERFORGE_REGISTRY`: Registry holding the test base
  /// - `XDG_DATA_HOME`: Isolated data path
  pub fn cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("layerforge");
    cmd.env("LAYERFORGE_STORE", self.store_path());
    cmd.env("LAYERFORGE_REGISTRY", self.registry_path());
    cmd.env("XDG_DATA_HOME", self.data_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// `layerforge build` of the context recipe in host isolation.
  pub fn build_cmd(&self) -> Command {
    let mut cmd = self.cmd();
    cmd.arg("build").arg(&self.recipe_path).args(["--isolation", "host"]);
    cmd
  }
}
