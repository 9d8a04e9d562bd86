//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// imagecache - master image cache for bare-metal provisioning
///
/// Downloads each image once into a shared master directory and hands it
/// out to destinations as hard links.
#[derive(Parser, Debug)]
#[command(name = "imagecache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "IMAGECACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch an image to a destination through the cache
    Fetch(FetchArgs),

    /// Evict expired and excess master images
    Clean(CleanArgs),

    /// Free disk space on a filesystem by cleaning registered caches
    Reclaim(ReclaimArgs),

    /// Show cached master images and usage
    Status(StatusArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the fetch command
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Image reference: registry UUID, glance:// URL, http(s):// URL or path
    pub reference: String,

    /// Destination path
    pub dest: PathBuf,

    /// Keep the image in its original format instead of converting to raw
    #[arg(long)]
    pub no_raw: bool,
}

/// Arguments for the clean command
#[derive(Parser, Debug)]
pub struct CleanArgs {
    /// Bytes that must be freed, on top of the TTL and size budget
    #[arg(short, long)]
    pub amount: Option<u64>,
}

/// Arguments for the reclaim command
#[derive(Parser, Debug)]
pub struct ReclaimArgs {
    /// Directory on the filesystem that needs space
    pub dir: PathBuf,

    /// Bytes required
    pub bytes: u64,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for the status command
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
