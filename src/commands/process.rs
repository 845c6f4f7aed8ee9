//! `process` and `catalog` commands.

use std::path::Path;

use owo_colors::OwoColorize;

use super::{build_walker, format_walk_report, shutdown_token};
use crate::config::Config;
use crate::error::Result;

/// Reconcile every catalog in the archive.
pub async fn cmd_process(config: &Config, archive_dir: &Path) -> Result<()> {
    let walker = build_walker(config, archive_dir)?;
    println!(
        "Processing catalogs in {}",
        archive_dir.display().to_string().cyan()
    );

    let report = walker.process_all(&shutdown_token()).await?;
    println!("{}", format_walk_report(&report));
    Ok(())
}

/// Reconcile a single catalog.
pub async fn cmd_catalog(config: &Config, archive_dir: &Path, name: &str) -> Result<()> {
    let walker = build_walker(config, archive_dir)?;
    println!("Processing catalog {}", name.cyan());

    let report = walker.process_catalog(name, &shutdown_token()).await?;
    println!("{}", format_walk_report(&report));
    Ok(())
}
