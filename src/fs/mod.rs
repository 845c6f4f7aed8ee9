//! Small file I/O helpers shared by the scanner, reconciler and walker.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use jiff::Timestamp;

use crate::error::{CatalogError, Result};

/// Suffix appended to a file name while it is being written.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Path of the sibling temp file used by [`write_file_atomic`].
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("file"));
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Write file atomically using temp file and rename.
///
/// Readers see either the previous content or the new content, never a
/// truncated file. The temp file keeps the full target name
/// (`index.json.tmp`) so two targets in one directory never share it.
pub fn write_file_atomic(path: &Path, content: &str) -> Result<()> {
    ensure_parent_dir(path)?;

    let temp_path = temp_path_for(path);

    std::fs::write(&temp_path, content)
        .map_err(|e| CatalogError::storage("write", &temp_path, e))?;

    std::fs::rename(&temp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        CatalogError::storage("rename", path, e)
    })
}

/// Ensure parent directory exists
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| CatalogError::storage("create", parent, e))?;
    }
    Ok(())
}

/// Delete a file if it exists.
///
/// Returns `true` if a file was removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CatalogError::storage("delete", path, e)),
    }
}

/// Creation time of `path` (modification time where unsupported), in whole
/// seconds. Falls back to the current time.
pub fn created_at(path: &Path) -> Timestamp {
    std::fs::metadata(path)
        .and_then(|m| m.created().or_else(|_| m.modified()))
        .ok()
        .and_then(|t| Timestamp::try_from(t).ok())
        .and_then(|t| Timestamp::from_second(t.as_second()).ok())
        .unwrap_or_else(crate::index::now)
}

/// True if `path` exists and is a regular file.
pub fn is_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file())
}
