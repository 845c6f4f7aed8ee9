use std::path::PathBuf;

use thiserror::Error;

use crate::analysis::AnalysisError;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid exclude pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to {operation} {}: {source}", path.display())]
    Storage {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("catalog '{0}' not found")]
    CatalogNotFound(String),

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CatalogError {
    pub(crate) fn storage(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        CatalogError::Storage {
            operation,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
