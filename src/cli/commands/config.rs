//! Config command - show or initialize configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::ImageCacheResult;
use console::{style, Emoji};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> ImageCacheResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
    }
    Ok(())
}

/// Write a default configuration file
pub async fn init_config(manager: &ConfigManager, force: bool) -> ImageCacheResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        println!("{}Config already exists at {}", WARN, path.display());
        println!("  {}", style("Use --force to overwrite").dim());
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    println!("{}Configuration initialized: {}", CHECK, path.display());
    Ok(())
}

fn show_config(config: &Config) -> ImageCacheResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
