//! `test` command: analyze one image without touching any index.

use std::path::Path;

use owo_colors::OwoColorize;

use crate::analysis::{VisionClient, analyze_file};
use crate::config::Config;
use crate::error::{CatalogError, Result};

pub async fn cmd_test(config: &Config, image: &Path) -> Result<()> {
    if !image.is_file() {
        return Err(CatalogError::Config(format!(
            "image not found: {}",
            image.display()
        )));
    }

    let client = VisionClient::from_config(config)?;
    println!(
        "Testing {} with model {}",
        image.display().to_string().cyan(),
        client.model().cyan()
    );

    let analysis = analyze_file(&client, image, &config.user_prompt).await?;

    println!("\n{}", "Analysis succeeded".green().bold());
    println!("{} {}", "Short name:".bold(), analysis.short_name);
    println!("{} {}", "Description:".bold(), analysis.description);
    println!("{} {}", "Model:".bold(), analysis.model_id.dimmed());
    Ok(())
}
