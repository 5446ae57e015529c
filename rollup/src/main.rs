use std::path::{Path, PathBuf};
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rollup::Pipeline;
use rollup_config::{Config, OverridableConfig};

/// Runs maintenance tasks of the rollup pipeline.
#[derive(Debug, Parser)]
#[command(name = "rollup", version)]
struct Cli {
    /// The config folder containing `config.yml`.
    #[arg(short, long, env = "ROLLUP_CONFIG", default_value = ".rollup")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drains the ingest queue into the rollup store.
    Digest,
    /// Deletes expired rows and undigested samples past their retention.
    Trim,
    /// Deletes all rows, or only those of the given types.
    Purge {
        /// Restricts the purge to a sample type. Can be repeated.
        #[arg(long = "type")]
        types: Vec<String>,
    },
    /// Prints the effective configuration.
    Config,
}

fn load_config(path: &Path) -> Result<Config> {
    let mut config = if Config::config_exists(path) {
        Config::from_path(path)?
    } else {
        Config::default()
    };

    config.apply_override(OverridableConfig::from_env())?;
    Ok(config)
}

#[allow(clippy::print_stdout)]
async fn run(command: Command, config: Config) -> Result<()> {
    if let Command::Config = command {
        print!("{}", config.to_yaml_string()?);
        return Ok(());
    }

    let pipeline = Pipeline::from_config(&config).await?;

    match command {
        Command::Digest => {
            let rows = pipeline.digest().await?;
            rollup_log::info!(rows, "digest complete");
        }
        Command::Trim => {
            let report = pipeline.trim().await?;
            rollup_log::info!(
                entries = report.store.entries,
                values = report.store.values,
                aggregates = report.store.aggregates,
                queue = report.queue,
                "trim complete"
            );
        }
        Command::Purge { types } => {
            let types = (!types.is_empty()).then_some(types);
            pipeline.storage().purge(types.as_deref()).await?;
        }
        Command::Config => {}
    }

    Ok(())
}

fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    rollup::init_logging(&config);
    rollup::init_metrics(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(cli.command, config))
}

pub fn main() {
    let exit_code = match execute() {
        Ok(()) => 0,
        Err(err) => {
            rollup_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
