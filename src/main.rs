//! fretforge - incremental part builds for parametric instruments
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use fretforge::cli::args::{ConfigAction, ConfigArgs};
use fretforge::cli::{Cli, Commands};
use fretforge::config::{Config, ConfigManager};
use fretforge::error::ForgeResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ForgeResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Path and init must work even when the existing file is broken
    let config = match &cli.command {
        Commands::Config(ConfigArgs {
            action: Some(ConfigAction::Path | ConfigAction::Init { .. }),
        }) => Config::default(),
        _ => config_manager.load().await?,
    };

    init_logging(cli.verbose, &config);

    match cli.command {
        Commands::Build(args) => fretforge::cli::commands::build(args, &config).await,
        Commands::Params(args) => fretforge::cli::commands::params(args, &config).await,
        Commands::Graph(args) => fretforge::cli::commands::graph(args).await,
        Commands::Config(args) => {
            fretforge::cli::commands::config(args, &config_manager, &config).await
        }
    }
}

/// 0 = warn (progress output only), 1 = info, 2+ = debug
fn init_logging(verbose: u8, config: &Config) {
    let filter = match verbose {
        0 => EnvFilter::new("fretforge=warn"),
        1 => EnvFilter::new("fretforge=info"),
        _ => EnvFilter::new("fretforge=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
