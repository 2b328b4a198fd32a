mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use openings_cache::config::Config;
use openings_cache::logging;

#[derive(Parser, Debug)]
#[command(name = "openings-cache")]
#[command(about = "Inspect and exercise the offline data cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/openings-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Held until exit so the file writer flushes
  let _log_guard = logging::init(&config.logging)?;

  commands::run(args.command, &config).await
}
