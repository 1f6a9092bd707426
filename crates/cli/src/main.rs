mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use layerforge_lib::config::{DEFAULT_COMPILER, DepgraphBackend};

use crate::output::{OutputFormat, print_error};

/// layerforge - build filesystem layers from unordered features
#[derive(Parser)]
#[command(name = "layerforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v: debug, -vv: trace)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build a layer and publish its record
  Build(BuildArgs),

  /// Show how a layer's features are split into phases
  Phases(InspectArgs),

  /// Show a layer's flattened mounts
  Mounts(InspectArgs),

  /// Show a layer's deduplicated features
  Features(InspectArgs),
}

#[derive(Args)]
pub struct BuildArgs {
  /// Path to the layer definition
  pub definition: PathBuf,

  /// Directory the layer record is published into
  #[arg(short, long)]
  pub out: PathBuf,

  /// Root of the per-layer staging directories
  #[arg(long, env = "LAYERFORGE_WORKDIR")]
  pub workdir: Option<PathBuf>,

  /// External compiler binary
  #[arg(long, env = "LAYERFORGE_COMPILER", default_value = DEFAULT_COMPILER)]
  pub compiler: PathBuf,

  /// Depgraph backend: native or external
  #[arg(long, default_value = "native")]
  pub depgraph: DepgraphBackend,

  /// Keep staged phase directories when the build fails
  #[arg(long)]
  pub keep_failed: bool,
}

#[derive(Args)]
pub struct InspectArgs {
  /// Path to the layer definition
  pub definition: PathBuf,

  /// Output format
  #[arg(long, value_enum, default_value_t)]
  pub format: OutputFormat,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = match cli.verbose {
    0 => "info",
    1 => "debug",
    _ => "trace",
  };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Build(args) => cmd::cmd_build(args),
    Commands::Phases(args) => cmd::cmd_phases(&args.definition, args.format),
    Commands::Mounts(args) => cmd::cmd_mounts(&args.definition, args.format),
    Commands::Features(args) => cmd::cmd_features(&args.definition, args.format),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}
