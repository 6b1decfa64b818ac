use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{init_structured_logging, LogFormat};
use orchestrator::{ConfigLoader, MedicConfig};
use std::path::PathBuf;

mod compare;
mod report;
mod simulate;
mod workers;

use compare::CompareArgs;
use simulate::SimulateArgs;

#[derive(Parser)]
#[command(name = "medic")]
#[command(about = "Self-healing orchestration for autonomous worker agents")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to medic.toml, medic.json, .medicrc, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated agents with injected failures and report how they healed
    Simulate(SimulateArgs),
    /// Run the same workload without healing, then with it, and compare success rates
    Compare(CompareArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Print built-in defaults instead of the loaded configuration
    #[arg(long)]
    defaults: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli).await?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.log_json {
        config.logging.format = LogFormat::Json;
    }

    match cli.command {
        Commands::Simulate(args) => {
            init_structured_logging(config.logging.clone())?;
            args.execute(config).await
        }
        Commands::Compare(args) => {
            init_structured_logging(config.logging.clone())?;
            args.execute(config).await
        }
        Commands::Config(args) => {
            let config = if args.defaults {
                MedicConfig::default()
            } else {
                config
            };
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn load_config(cli: &Cli) -> Result<MedicConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    loader.load().await.context("Failed to load configuration")
}
