//! Test utilities for layerforge-lib.
//!
//! Fake package and manifest tools stand in for apt and pip: they only touch
//! files under the rootfs, so pipeline tests run in host isolation without
//! network access.

use std::fs;
use std::path::{Path, PathBuf};

use crate::recipe::{ManifestTool, PackageTool};

/// Requirements used by the reference recipe.
pub const REFERENCE_REQUIREMENTS: &str = "\
# rag stack
langchain==0.1.0
chromadb==0.4.22
streamlit==1.31.0
pypdf==4.0.1
";

/// A package tool that records installs in `var/lib/dpkg/installed`.
///
/// `nosuchpkg` fails to resolve with apt's wording.
pub fn fake_package_tool() -> PackageTool {
  PackageTool {
    prepare: Some(r#"mkdir -p "$${rootfs}/var/lib/apt/lists" && touch "$${rootfs}/var/lib/apt/lists/index""#.into()),
    resolve: Some(
      r#"case "$${package}" in nosuchpkg) echo "E: Unable to locate package $${package}" >&2; exit 100;; esac"#.into(),
    ),
    install: r#"mkdir -p "$${rootfs}/var/lib/dpkg" "$${rootfs}/var/cache/apt/archives" && echo $${packages} >> "$${rootfs}/var/lib/dpkg/installed""#.into(),
    clean: Some("true".into()),
    caches: vec!["/var/lib/apt/lists".into(), "/var/cache/apt/archives".into()],
  }
}

/// A manifest tool that appends the manifest to `usr/lib/python3/site-packages/installed.txt`.
///
/// Requirements starting with `not-a-real-package` fail to resolve.
pub fn fake_manifest_tool() -> ManifestTool {
  ManifestTool {
    resolve: Some(
      r#"case "$${requirement}" in not-a-real-package*) echo "ERROR: No matching distribution found for $${requirement}" >&2; exit 1;; esac"#.into(),
    ),
    install: r#"mkdir -p "$${rootfs}/usr/lib/python3/site-packages" "$${rootfs}/root/.cache/pip" && cat "$${manifest}" >> "$${rootfs}/usr/lib/python3/site-packages/installed.txt""#.into(),
    caches: vec!["/root/.cache/pip".into()],
  }
}

/// The fake tools as a recipe `tools` table.
pub fn fake_tools_lua() -> String {
  let p = fake_package_tool();
  let m = fake_manifest_tool();
  format!(
    "{{ packages = {{ prepare = [[{}]], resolve = [[{}]], install = [[{}]], clean = [[{}]], caches = {{ {} }} }}, \
     manifest = {{ resolve = [[{}]], install = [[{}]], caches = {{ {} }} }} }}",
    p.prepare.unwrap_or_default(),
    p.resolve.unwrap_or_default(),
    p.install,
    p.clean.unwrap_or_default(),
    lua_list(&p.caches),
    m.resolve.unwrap_or_default(),
    m.install,
    lua_list(&m.caches),
  )
}

fn lua_list(items: &[String]) -> String {
  items.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>().join(", ")
}

/// Create `<registry>/<id>/<version>/rootfs` with a minimal tree.
pub fn create_base(registry: &Path, id: &str, version: &str) -> PathBuf {
  let rootfs = registry.join(id).join(version).join("rootfs");
  for dir in ["bin", "etc", "tmp", "usr/lib/python3/site-packages", "var/lib/apt"] {
    fs::create_dir_all(rootfs.join(dir)).unwrap();
  }
  fs::write(rootfs.join("etc/os-release"), format!("ID={id}\nVERSION={version}\n")).unwrap();
  rootfs
}

/// The reference recipe with fake tools, as Lua source.
pub fn reference_recipe(source_mode: &str) -> String {
  format!(
    r#"return {{
  name = "rag-dev",
  base = "python:3.10-slim",
  source = "{source_mode}",
  tools = {tools},
  setup = function(img)
    img:env {{ DEBIAN_FRONTEND = "noninteractive", PYTHONUNBUFFERED = "1", PYTHONDONTWRITEBYTECODE = "1" }}
    img:workdir "/app"
    img:packages {{ "build-essential", "git", "curl", "poppler-utils", "libgl1" }}
    img:install "requirements.txt"
    img:mkdir("data/chroma", {{ persistent = true }})
    img:copy(".", ".")
    img:expose(8501)
  end,
}}
"#,
    tools = fake_tools_lua()
  )
}

/// Write a build context with the reference recipe, a manifest and sources.
///
/// Returns the recipe path.
pub fn write_context(dir: &Path, recipe: &str, requirements: &str) -> PathBuf {
  fs::create_dir_all(dir.join("rag")).unwrap();
  fs::write(dir.join("requirements.txt"), requirements).unwrap();
  fs::write(dir.join("app.py"), "import streamlit as st\nst.title('rag')\n").unwrap();
  fs::write(dir.join("rag/index.py"), "def build_index():\n    pass\n").unwrap();
  let recipe_path = dir.join("Imagefile.lua");
  fs::write(&recipe_path, recipe).unwrap();
  recipe_path
}
