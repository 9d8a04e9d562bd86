//! Fetch command - fetch one image through the cache

use crate::cli::args::FetchArgs;
use crate::cli::CacheContext;
use crate::config::Config;
use crate::error::ImageCacheResult;
use console::{style, Emoji};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");

/// Execute the fetch command
pub async fn execute(args: FetchArgs, config: &Config) -> ImageCacheResult<()> {
    let ctx = CacheContext::open(config)?;
    let force_raw = !args.no_raw;

    ctx.cache
        .fetch_image(&args.reference, &args.dest, force_raw)
        .await?;

    println!(
        "{}{} -> {}",
        CHECK,
        style(&args.reference).bold(),
        args.dest.display()
    );
    Ok(())
}
