//! imagecache - master image cache CLI
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use imagecache::cli::args::{ConfigAction, ConfigArgs};
use imagecache::cli::{Cli, Commands};
use imagecache::config::ConfigManager;
use imagecache::error::ImageCacheResult;
use std::process::ExitCode;
use tracing::debug;
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

async fn run() -> ImageCacheResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Init must work even when the existing file no longer parses
    if let Commands::Config(ConfigArgs {
        action: Some(ConfigAction::Init { force }),
    }) = cli.command
    {
        init_logging(cli.verbose, false);
        return imagecache::cli::commands::config::init_config(&config_manager, force).await;
    }

    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    init_logging(cli.verbose, config.general.log_format == "json");
    debug!("Loaded configuration from {}", config_manager.path().display());

    match cli.command {
        Commands::Fetch(args) => imagecache::cli::commands::fetch(args, &config).await,
        Commands::Clean(args) => imagecache::cli::commands::clean(args, &config).await,
        Commands::Reclaim(args) => imagecache::cli::commands::reclaim(args, &config).await,
        Commands::Status(args) => imagecache::cli::commands::status(args, &config).await,
        Commands::Config(args) => {
            imagecache::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

fn init_logging(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("imagecache=warn"),
        1 => EnvFilter::new("imagecache=info"),
        _ => EnvFilter::new("imagecache=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
