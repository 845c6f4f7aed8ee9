//! Directory listing and index loading.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{CatalogError, Result};
use crate::exclude::ExclusionMatcher;
use crate::index::{DirectoryIndex, GlobalIndex, is_reserved_name};

/// Finds image files in a single directory and loads its persisted index.
#[derive(Debug, Clone)]
pub struct FileScanner {
    /// Lowercase extensions with a leading dot.
    extensions: Vec<String>,
    exclude: ExclusionMatcher,
}

impl FileScanner {
    pub fn new<S: AsRef<str>>(extensions: &[S], exclude: ExclusionMatcher) -> Self {
        let extensions = extensions
            .iter()
            .map(|e| {
                let e = e.as_ref().trim().to_lowercase();
                if e.starts_with('.') { e } else { format!(".{e}") }
            })
            .collect();
        Self {
            extensions,
            exclude,
        }
    }

    /// Build a scanner for the archive rooted at `archive_dir`.
    ///
    /// Exclude patterns match both absolute paths and paths relative to the
    /// archive root. Fails on invalid patterns.
    pub fn from_config(config: &Config, archive_dir: &Path) -> Result<Self> {
        let exclude = ExclusionMatcher::new(&config.exclude_filter)?.with_base(archive_dir);
        Ok(Self::new(&config.supported_extensions, exclude))
    }

    pub fn should_exclude(&self, path: &Path) -> bool {
        self.exclude.should_exclude(path)
    }

    /// True if the file name carries a supported extension (case-insensitive).
    pub fn is_supported(&self, path: &Path) -> bool {
        let Some(ext) = path.extension() else {
            return false;
        };
        let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
        self.extensions.contains(&ext)
    }

    /// True iff at least one direct child file has a supported extension.
    ///
    /// Unreadable directories report `false`.
    pub fn has_images(&self, dir: &Path) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        entries
            .filter_map(|e| e.ok())
            .any(|e| e.file_type().is_ok_and(|t| !t.is_dir()) && self.is_supported(&e.path()))
    }

    /// List the images directly inside `dir`, sorted by path.
    ///
    /// Reserved index files and excluded paths are filtered out. A missing
    /// directory yields an empty list; other read failures are errors.
    pub fn find_images_to_process(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CatalogError::storage("list", dir, e)),
        };

        let mut images: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .is_some_and(|n| !is_reserved_name(&n.to_string_lossy()))
            })
            .filter(|path| self.is_supported(path))
            .filter(|path| !self.exclude.should_exclude(path))
            .collect();
        images.sort();
        Ok(images)
    }

    /// Load a directory index.
    ///
    /// A missing file and a malformed file both yield an empty index; a
    /// corrupted index must never block cataloging new images. Only read
    /// failures on an existing file are reported.
    pub fn load_existing_data(&self, index_path: &Path) -> Result<DirectoryIndex> {
        let Some(content) = read_optional(index_path)? else {
            return Ok(DirectoryIndex::new());
        };
        match DirectoryIndex::from_json(&content) {
            Ok(index) => Ok(index),
            Err(e) => {
                tracing::warn!(
                    path = %index_path.display(),
                    "index is unreadable ({e}), starting from an empty index"
                );
                Ok(DirectoryIndex::new())
            }
        }
    }

    /// Load the archive-level global index with the same tolerance rules.
    pub fn load_global_index(&self, index_path: &Path) -> Result<GlobalIndex> {
        let Some(content) = read_optional(index_path)? else {
            return Ok(GlobalIndex::new());
        };
        match GlobalIndex::from_json(&content) {
            Ok(index) => Ok(index),
            Err(e) => {
                tracing::warn!(path = %index_path.display(), "global index is unreadable: {e}");
                Ok(GlobalIndex::new())
            }
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CatalogError::storage("read", path, e)),
    }
}
