mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildOptions, RunArgs};
use crate::output::OutputFormat;

/// layerforge - cached build layers for development images
#[derive(Parser)]
#[command(name = "layerforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose logging (RUST_LOG takes precedence)
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build an image from a recipe
  Build {
    /// Path to the recipe file
    #[arg(default_value = "Imagefile.lua")]
    recipe: PathBuf,

    /// Image name (defaults to the recipe's name)
    #[arg(short, long)]
    name: Option<String>,

    /// Base registry: a directory or an http(s):// URL (default: $LAYERFORGE_REGISTRY)
    #[arg(long)]
    registry: Option<String>,

    /// Command isolation: chroot or host
    #[arg(long)]
    isolation: Option<String>,

    /// Ignore cached layers (new layers are still published)
    #[arg(long)]
    no_cache: bool,

    /// Source mode override: materialized or mounted
    #[arg(long)]
    source_mode: Option<String>,

    /// Bound on network steps, e.g. "10m" or "90s"
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
  },

  /// Show the steps of a recipe and which are cached
  Plan {
    /// Path to the recipe file
    #[arg(default_value = "Imagefile.lua")]
    recipe: PathBuf,

    /// Base registry: a directory or an http(s):// URL (default: $LAYERFORGE_REGISTRY)
    #[arg(long)]
    registry: Option<String>,

    /// Source mode override: materialized or mounted
    #[arg(long)]
    source_mode: Option<String>,
  },

  /// Show an image's configuration and launch plan
  Inspect {
    /// Image name
    image: String,
  },

  /// Run an image's entrypoint in the foreground
  Run {
    /// Image name
    image: String,

    /// Attach a host directory at a declared path (HOST:PATH)
    #[arg(short = 'V', long = "volume")]
    volumes: Vec<String>,

    /// Command isolation: chroot or host
    #[arg(long)]
    isolation: Option<String>,

    /// Keep the container directory after exit
    #[arg(long)]
    keep: bool,

    /// Entrypoint override (after `--`)
    #[arg(last = true)]
    command: Vec<String>,
  },

  /// List built images
  Images,

  /// Remove layers, staging directories and bases no image refers to
  Gc {
    /// Show what would be removed without deleting
    #[arg(long)]
    dry_run: bool,
  },

  /// Show store, registry and platform information
  Info,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build {
      recipe,
      name,
      registry,
      isolation,
      no_cache,
      source_mode,
      timeout,
    } => cmd::cmd_build(
      BuildOptions {
        recipe,
        name,
        registry,
        isolation,
        no_cache,
        source_mode,
        timeout,
      },
      cli.output,
    ),
    Commands::Plan {
      recipe,
      registry,
      source_mode,
    } => cmd::cmd_plan(&recipe, registry, source_mode, cli.output),
    Commands::Inspect { image } => cmd::cmd_inspect(&image, cli.output),
    Commands::Run {
      image,
      volumes,
      isolation,
      keep,
      command,
    } => cmd::cmd_run(RunArgs {
      image,
      volumes,
      isolation,
      keep,
      command,
    }),
    Commands::Images => cmd::cmd_images(cli.output),
    Commands::Gc { dry_run } => cmd::cmd_gc(dry_run, cli.output),
    Commands::Info => cmd::cmd_info(cli.output),
  }
}
