//! Reclaim command - free disk space through the cross-cache coordinator

use crate::cache::format_bytes;
use crate::cli::args::ReclaimArgs;
use crate::cli::CacheContext;
use crate::config::Config;
use crate::error::ImageCacheResult;
use console::Emoji;

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");

/// Execute the reclaim command
pub async fn execute(args: ReclaimArgs, config: &Config) -> ImageCacheResult<()> {
    let ctx = CacheContext::open(config)?;

    ctx.coordinator.reclaim_space(&args.dir, args.bytes).await?;

    println!(
        "{}{} available on {}",
        CHECK,
        format_bytes(args.bytes),
        args.dir.display()
    );
    Ok(())
}
