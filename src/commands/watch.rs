//! `watch` command: keep the archive indexed while files change.

use std::path::Path;
use std::sync::Arc;

use owo_colors::OwoColorize;
use tracing::info;

use super::{build_walker, shutdown_token};
use crate::config::Config;
use crate::error::Result;
use crate::queue::{TaskQueue, TriggerSource};
use crate::watcher::CatalogWatcher;

/// Queue every catalog once, then reindex catalogs as their files change
/// until Ctrl-C.
pub async fn cmd_watch(config: &Config, archive_dir: &Path) -> Result<()> {
    let walker = Arc::new(build_walker(config, archive_dir)?);
    let catalogs = walker.catalog_names()?;

    let queue = Arc::new(TaskQueue::new(walker, config.queue_capacity));
    queue.start();

    let watcher = match CatalogWatcher::start(
        archive_dir,
        &config.supported_extensions,
        config.watch_debounce(),
        Arc::clone(&queue),
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            queue.stop().await;
            return Err(e);
        }
    };

    let queued = catalogs
        .into_iter()
        .filter(|name| queue.add_task(name.as_str(), TriggerSource::Startup))
        .count();
    info!(catalogs = queued, "startup scan queued");

    println!(
        "Watching {} (press Ctrl-C to stop)",
        archive_dir.display().to_string().cyan()
    );
    shutdown_token().cancelled().await;

    watcher.stop();
    queue.stop().await;
    println!("{}", "Stopped".dimmed());
    Ok(())
}
