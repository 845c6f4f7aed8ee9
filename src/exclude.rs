//! Glob-based exclusion of files and directory subtrees.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{CatalogError, Result};

/// Evaluates shell-style exclude patterns (`*`, `**`, `?`, `[..]`) against paths.
///
/// A path is excluded when it, or any of its ancestors, matches one of the
/// patterns. `*` never crosses a `/`; `**` spans any number of segments.
/// With a base directory set, paths under it are matched relative to it, so
/// the base's own ancestors never trigger a pattern.
#[derive(Debug, Clone, Default)]
pub struct ExclusionMatcher {
    set: Option<GlobSet>,
    base: Option<PathBuf>,
}

impl ExclusionMatcher {
    /// Compile `patterns`. Any invalid pattern fails the whole matcher.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let raw = pattern.as_ref();
            let trimmed = raw.trim().trim_start_matches("./");
            let glob = GlobBuilder::new(trimmed)
                .literal_separator(true)
                .build()
                .map_err(|source| CatalogError::InvalidPattern {
                    pattern: raw.to_string(),
                    source,
                })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|source| CatalogError::InvalidPattern {
                pattern: patterns
                    .iter()
                    .map(|p| p.as_ref())
                    .collect::<Vec<_>>()
                    .join(", "),
                source,
            })?;

        Ok(Self {
            set: Some(set),
            base: None,
        })
    }

    /// Match paths under `base` (the archive root) relative to it.
    pub fn with_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// True when no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.set.is_none()
    }

    pub fn should_exclude(&self, path: &Path) -> bool {
        let Some(set) = &self.set else {
            return false;
        };
        let matches = |path: &Path| {
            path.ancestors()
                .filter(|p| !p.as_os_str().is_empty())
                .any(|p| set.is_match(p))
        };
        match self.base.as_deref().and_then(|b| path.strip_prefix(b).ok()) {
            Some(relative) => matches(relative),
            None => matches(path),
        }
    }
}
