//! Clean command - run the eviction sweep

use crate::cache::format_bytes;
use crate::cli::args::CleanArgs;
use crate::cli::CacheContext;
use crate::config::Config;
use crate::error::ImageCacheResult;
use console::{style, Emoji};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

/// Execute the clean command
pub async fn execute(args: CleanArgs, config: &Config) -> ImageCacheResult<()> {
    let ctx = CacheContext::open(config)?;

    if ctx.cache.master_dir().is_none() {
        println!(
            "{}Caching disabled, nothing to clean (set cache.master_dir to enable)",
            WARN
        );
        return Ok(());
    }

    let before = ctx.cache.total_size()?;
    let unmet = ctx.cache.clean_up(args.amount).await;
    let after = ctx.cache.total_size()?;

    println!(
        "{}Freed {} ({} remaining)",
        CHECK,
        format_bytes(before.saturating_sub(after)),
        format_bytes(after)
    );

    if unmet > 0 {
        println!(
            "{}{} of the requested amount could not be freed",
            WARN,
            style(format_bytes(unmet)).yellow()
        );
    }
    Ok(())
}
