//! Status command - list master images and cache usage

use crate::cache::{format_bytes, CacheSizeStatus, MasterEntry};
use crate::cli::args::{OutputFormat, StatusArgs};
use crate::cli::CacheContext;
use crate::config::Config;
use crate::error::ImageCacheResult;
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct StatusJson {
    enabled: bool,
    master_dir: Option<PathBuf>,
    total_bytes: u64,
    limit_bytes: u64,
    ttl_secs: u64,
    status: &'static str,
    entries: Vec<EntryJson>,
}

#[derive(Serialize)]
struct EntryJson {
    name: String,
    size: u64,
    links: u64,
    in_use: bool,
    last_used: DateTime<Utc>,
}

impl From<&MasterEntry> for EntryJson {
    fn from(entry: &MasterEntry) -> Self {
        Self {
            name: entry.file_name(),
            size: entry.size,
            links: entry.links,
            in_use: entry.in_use(),
            last_used: entry.last_used.into(),
        }
    }
}

/// Execute the status command
pub async fn execute(args: StatusArgs, config: &Config) -> ImageCacheResult<()> {
    let ctx = CacheContext::open(config)?;
    let cache = &ctx.cache;

    let mut entries = cache.entries()?;
    entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
    let total = cache.total_size()?;
    let limit = cache.cache_size_bytes();
    let status = CacheSizeStatus::from_usage(total, limit);

    match args.format {
        OutputFormat::Json => {
            let json = StatusJson {
                enabled: cache.master_dir().is_some(),
                master_dir: cache.master_dir().map(PathBuf::from),
                total_bytes: total,
                limit_bytes: limit,
                ttl_secs: cache.cache_ttl().as_secs(),
                status: status_label(status),
                entries: entries.iter().map(EntryJson::from).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.file_name());
            }
        }
        OutputFormat::Table => {
            let Some(master_dir) = cache.master_dir() else {
                println!("Caching disabled (set cache.master_dir to enable)");
                return Ok(());
            };
            print_table(&entries);
            println!(
                "{} {} / {} ({:.0}%) {} {}",
                style("Usage:").bold(),
                format_bytes(total),
                format_bytes(limit),
                CacheSizeStatus::percentage(total, limit),
                styled_status(status),
                style(master_dir.display()).dim()
            );
        }
    }

    Ok(())
}

fn print_table(entries: &[MasterEntry]) {
    if entries.is_empty() {
        println!("No master images cached.");
        println!();
        return;
    }

    println!(
        "{:<48} {:>10} {:>6} {:<20}",
        "IMAGE", "SIZE", "LINKS", "LAST USED"
    );
    println!("{}", "-".repeat(88));

    for entry in entries {
        let last_used: DateTime<Utc> = entry.last_used.into();
        let links = if entry.in_use() {
            style(entry.links.to_string()).green().to_string()
        } else {
            style(entry.links.to_string()).dim().to_string()
        };
        println!(
            "{:<48} {:>10} {:>6} {:<20}",
            entry.file_name(),
            format_bytes(entry.size),
            links,
            last_used.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {} image(s)", entries.len());
}

fn status_label(status: CacheSizeStatus) -> &'static str {
    match status {
        CacheSizeStatus::Ok => "ok",
        CacheSizeStatus::Warning => "warning",
        CacheSizeStatus::Exceeded => "exceeded",
    }
}

fn styled_status(status: CacheSizeStatus) -> String {
    match status {
        CacheSizeStatus::Ok => style("ok").green().to_string(),
        CacheSizeStatus::Warning => style("warning").yellow().to_string(),
        CacheSizeStatus::Exceeded => style("exceeded").red().to_string(),
    }
}
