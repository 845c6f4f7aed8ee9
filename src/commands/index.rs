//! `rebuild-index` and `list` commands.

use std::path::Path;

use owo_colors::OwoColorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::build_walker;
use crate::config::Config;
use crate::error::Result;
use crate::index::{GlobalIndex, INDEX_JSON};
use crate::scanner::FileScanner;

/// A row in the catalog table
#[derive(Tabled)]
struct CatalogRow {
    #[tabled(rename = "Catalog")]
    name: String,
    #[tabled(rename = "Images")]
    image_count: usize,
    #[tabled(rename = "Last update")]
    last_update: String,
}

fn rows(global: &GlobalIndex) -> Vec<CatalogRow> {
    global
        .iter()
        .map(|summary| CatalogRow {
            name: summary.name.clone(),
            image_count: summary.image_count,
            last_update: summary.last_update.to_string(),
        })
        .collect()
}

/// Regenerate the root index from the directory indexes without analyzing anything.
pub fn cmd_rebuild_index(config: &Config, archive_dir: &Path) -> Result<()> {
    let walker = build_walker(config, archive_dir)?;
    let global = walker.rebuild_global_index()?;
    println!(
        "Rebuilt {} with {} catalog(s)",
        archive_dir.join(INDEX_JSON).display().to_string().cyan(),
        global.len()
    );
    Ok(())
}

/// Print the root index as a table.
pub fn cmd_list(config: &Config, archive_dir: &Path) -> Result<()> {
    let scanner = FileScanner::from_config(config, archive_dir)?;
    let global = scanner.load_global_index(&archive_dir.join(INDEX_JSON))?;

    if global.is_empty() {
        println!(
            "{}",
            "No catalogs indexed yet. Run `kbase-catalog process` first.".dimmed()
        );
        return Ok(());
    }

    let mut table = Table::new(rows(&global));
    table.with(Style::rounded());
    println!("{table}");

    let total: usize = global.iter().map(|s| s.image_count).sum();
    println!("\n{} catalog(s), {} image(s)", global.len(), total);
    Ok(())
}
