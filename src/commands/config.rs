//! `init-config` command.

use std::path::Path;

use owo_colors::OwoColorize;

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::error::{CatalogError, Result};

/// Write the default configuration to `path` (default `config.yaml`).
///
/// Refuses to overwrite an existing file unless `force` is set.
pub fn cmd_init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    if path.exists() && !force {
        return Err(CatalogError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display().to_string().cyan());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_config_writes_loadable_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");

        cmd_init_config(Some(&path), false).unwrap();
        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.model, Config::default().model);
        assert_eq!(loaded.parallel_requests, 3);
    }

    #[test]
    fn test_init_config_does_not_overwrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "model: custom\n").unwrap();

        assert!(cmd_init_config(Some(&path), false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "model: custom\n");

        cmd_init_config(Some(&path), true).unwrap();
        assert!(Config::load(Some(&path)).unwrap().model != "custom");
    }
}
