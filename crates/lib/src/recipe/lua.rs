//! Lua bindings for recipe files.
//!
//! A recipe returns a table whose `setup` function receives an `img` userdata.
//! Each `img:*` call records one declaration in order; nothing is validated
//! until [`super::finalize`] walks the recorded list.

use std::collections::BTreeMap;
use std::path::Path;

use mlua::prelude::*;

use super::types::{ManifestTool, PackageTool, RecipeError, SourceMode};
use super::{BaseSpec, Recipe, finalize};
use crate::platform::host_triple;

/// A declaration as written in the recipe, before path resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStep {
  Env(BTreeMap<String, String>),
  Workdir(String),
  Packages(Vec<String>),
  Install { manifest: String, dest: Option<String> },
  Mkdir { path: String, persistent: bool },
  Copy { src: String, dest: String, exclude: Option<Vec<String>> },
  Expose(i64),
  Entrypoint(Vec<String>),
}

/// The `img` object handed to `setup`.
#[derive(Debug, Default)]
pub struct RecipeCtx {
  steps: Vec<RawStep>,
}

impl RecipeCtx {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn into_steps(self) -> Vec<RawStep> {
    self.steps
  }
}

impl LuaUserData for RecipeCtx {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("step_count", |_, this| Ok(this.steps.len()));
  }

  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_method_mut("env", |_, this, vars: LuaTable| {
      let mut map = BTreeMap::new();
      for pair in vars.pairs::<String, String>() {
        let (key, value) = pair?;
        map.insert(key, value);
      }
      this.steps.push(RawStep::Env(map));
      Ok(())
    });

    methods.add_method_mut("workdir", |_, this, path: String| {
      this.steps.push(RawStep::Workdir(path));
      Ok(())
    });

    methods.add_method_mut("packages", |_, this, packages: Vec<String>| {
      this.steps.push(RawStep::Packages(packages));
      Ok(())
    });

    methods.add_method_mut("install", |_, this, (manifest, opts): (String, Option<LuaTable>)| {
      let dest = match opts {
        Some(t) => t.get::<Option<String>>("dest")?,
        None => None,
      };
      this.steps.push(RawStep::Install { manifest, dest });
      Ok(())
    });

    methods.add_method_mut("mkdir", |_, this, (path, opts): (String, Option<LuaTable>)| {
      let persistent = match opts {
        Some(t) => t.get::<Option<bool>>("persistent")?.unwrap_or(false),
        None => false,
      };
      this.steps.push(RawStep::Mkdir { path, persistent });
      Ok(())
    });

    methods.add_method_mut(
      "copy",
      |_, this, (src, dest, opts): (String, Option<String>, Option<LuaTable>)| {
        let exclude = match opts {
          Some(t) => t.get::<Option<Vec<String>>>("exclude")?,
          None => None,
        };
        this.steps.push(RawStep::Copy {
          src,
          dest: dest.unwrap_or_else(|| ".".to_string()),
          exclude,
        });
        Ok(())
      },
    );

    methods.add_method_mut("expose", |_, this, port: i64| {
      this.steps.push(RawStep::Expose(port));
      Ok(())
    });

    methods.add_method_mut("entrypoint", |_, this, spec: LuaValue| {
      let argv = match spec {
        LuaValue::String(s) => vec![s.to_str()?.to_string()],
        LuaValue::Table(t) => t.sequence_values::<String>().collect::<LuaResult<Vec<_>>>()?,
        _ => return Err(LuaError::external("entrypoint() expects a string or a list of strings")),
      };
      this.steps.push(RawStep::Entrypoint(argv));
      Ok(())
    });
  }
}

/// Evaluate the recipe file at `path`.
///
/// The directory containing the file becomes the build context.
pub fn evaluate_recipe(path: &Path) -> Result<Recipe, RecipeError> {
  let canonical = dunce::canonicalize(path).map_err(|source| RecipeError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let content = std::fs::read_to_string(&canonical).map_err(|source| RecipeError::Read {
    path: canonical.clone(),
    source,
  })?;
  let context_dir = canonical.parent().unwrap_or(Path::new("/")).to_path_buf();

  evaluate_recipe_source(&content, &canonical.display().to_string(), &context_dir)
}

/// Evaluate recipe source text with an explicit build context.
pub fn evaluate_recipe_source(source: &str, chunk_name: &str, context_dir: &Path) -> Result<Recipe, RecipeError> {
  let lua = Lua::new();
  register_globals(&lua, context_dir)?;

  let value = lua.load(source).set_name(format!("@{chunk_name}")).eval::<LuaValue>()?;
  let table = match value {
    LuaValue::Table(t) => t,
    _ => return Err(RecipeError::MissingField("base")),
  };

  let base_ref: Option<String> = table.get("base")?;
  let base = BaseSpec::parse(&base_ref.ok_or(RecipeError::MissingField("base"))?)?;

  let name = table.get::<Option<String>>("name")?.unwrap_or_else(|| {
    context_dir
      .file_name()
      .map(|n| n.to_string_lossy().to_string())
      .unwrap_or_else(|| "image".to_string())
  });

  let source_mode = match table.get::<Option<String>>("source")? {
    Some(mode) => SourceMode::parse(&mode).ok_or(RecipeError::UnknownSourceMode(mode))?,
    None => SourceMode::default(),
  };

  let (package_tool, manifest_tool) = match table.get::<Option<LuaTable>>("tools")? {
    Some(tools) => (
      parse_package_tool(tools.get("packages")?)?,
      parse_manifest_tool(tools.get("manifest")?)?,
    ),
    None => (PackageTool::default(), ManifestTool::default()),
  };

  let setup: LuaFunction = table
    .get::<Option<LuaFunction>>("setup")?
    .ok_or(RecipeError::MissingField("setup"))?;

  let ctx_userdata = lua.create_userdata(RecipeCtx::new())?;
  setup.call::<()>(&ctx_userdata)?;
  let ctx: RecipeCtx = ctx_userdata.take()?;

  finalize(
    name,
    base,
    source_mode,
    &package_tool,
    &manifest_tool,
    ctx.into_steps(),
    context_dir.to_path_buf(),
  )
}

fn register_globals(lua: &Lua, context_dir: &Path) -> LuaResult<()> {
  let globals = lua.create_table()?;
  globals.set("dir", context_dir.to_string_lossy().to_string())?;
  globals.set("host", host_triple())?;
  lua.globals().set("layerforge", globals)?;
  Ok(())
}

/// `nil` keeps the default, `false` disables an optional command.
fn optional_command(table: &LuaTable, key: &str, default: Option<String>) -> LuaResult<Option<String>> {
  match table.get::<LuaValue>(key)? {
    LuaValue::Nil => Ok(default),
    LuaValue::Boolean(false) => Ok(None),
    LuaValue::String(s) => Ok(Some(s.to_str()?.to_string())),
    other => Err(LuaError::external(format!(
      "tool field '{key}' must be a string or false, got {}",
      other.type_name()
    ))),
  }
}

fn parse_package_tool(table: Option<LuaTable>) -> LuaResult<PackageTool> {
  let defaults = PackageTool::default();
  let Some(t) = table else {
    return Ok(defaults);
  };
  Ok(PackageTool {
    prepare: optional_command(&t, "prepare", defaults.prepare)?,
    resolve: optional_command(&t, "resolve", defaults.resolve)?,
    install: t.get::<Option<String>>("install")?.unwrap_or(defaults.install),
    clean: optional_command(&t, "clean", defaults.clean)?,
    caches: t.get::<Option<Vec<String>>>("caches")?.unwrap_or(defaults.caches),
  })
}

fn parse_manifest_tool(table: Option<LuaTable>) -> LuaResult<ManifestTool> {
  let defaults = ManifestTool::default();
  let Some(t) = table else {
    return Ok(defaults);
  };
  Ok(ManifestTool {
    resolve: optional_command(&t, "resolve", defaults.resolve)?,
    install: t.get::<Option<String>>("install")?.unwrap_or(defaults.install),
    caches: t.get::<Option<Vec<String>>>("caches")?.unwrap_or(defaults.caches),
  })
}
