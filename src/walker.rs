//! Archive traversal and global index maintenance.
//!
//! The archive root is a container: each top-level directory is a catalog,
//! and every directory inside a catalog (the catalog directory included) gets
//! its own reconciliation pass. Excluded directories are pruned together with
//! everything below them. After a walk, the root `index.json` and `index.md`
//! are regenerated from the per-directory files on disk.

use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::Analyzer;
use crate::config::Config;
use crate::error::{CatalogError, Result};
use crate::fs::{created_at, is_file, write_file_atomic};
use crate::index::markdown::render_root;
use crate::index::{GlobalIndex, INDEX_JSON, INDEX_MD};
use crate::queue::{ReindexHandler, ReindexTask};
use crate::reconciler::DirectoryReconciler;
use crate::scanner::FileScanner;

/// Totals of one walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkReport {
    /// Directories that completed a reconciliation pass.
    pub reconciled: usize,
    /// Of those, directories left with index data.
    pub with_data: usize,
    /// Directories skipped because of an I/O error.
    pub failed: usize,
    /// Images sent to the analyzer.
    pub analyzed: usize,
    /// Analyses recorded as failed.
    pub analysis_failures: usize,
}

/// Walks catalogs under an archive root.
pub struct CatalogWalker<A> {
    archive_dir: PathBuf,
    reconciler: DirectoryReconciler<A>,
}

impl<A: Analyzer + 'static> CatalogWalker<A> {
    pub fn new(archive_dir: impl Into<PathBuf>, reconciler: DirectoryReconciler<A>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            reconciler,
        }
    }

    pub fn from_config(archive_dir: impl Into<PathBuf>, config: &Config, analyzer: A) -> Result<Self> {
        let archive_dir = archive_dir.into();
        let reconciler = DirectoryReconciler::from_config(config, &archive_dir, analyzer)?;
        Ok(Self::new(archive_dir, reconciler))
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn reconciler(&self) -> &DirectoryReconciler<A> {
        &self.reconciler
    }

    fn scanner(&self) -> &FileScanner {
        self.reconciler.scanner()
    }

    /// Names of the top-level catalog directories, sorted. Excluded ones are left out.
    pub fn catalog_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = child_dirs(&self.archive_dir)?
            .into_iter()
            .filter(|dir| !self.scanner().should_exclude(dir))
            .filter_map(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Reconcile every catalog, then rebuild the global index.
    pub async fn process_all(&self, cancel: &CancellationToken) -> Result<WalkReport> {
        info!(archive = %self.archive_dir.display(), "processing all catalogs");
        let mut report = WalkReport::default();
        for name in self.catalog_names()? {
            let root = self.archive_dir.join(&name);
            self.walk(&root, &name, cancel, &mut report).await?;
        }
        self.rebuild_global_index()?;
        info!(
            directories = report.reconciled,
            analyzed = report.analyzed,
            failures = report.analysis_failures,
            "archive processed"
        );
        Ok(report)
    }

    /// Reconcile a single catalog subtree, then rebuild the global index.
    pub async fn process_catalog(&self, name: &str, cancel: &CancellationToken) -> Result<WalkReport> {
        let root = self.catalog_dir(name)?;
        let mut report = WalkReport::default();

        if self.scanner().should_exclude(&root) {
            info!(catalog = %name, "catalog is excluded, skipping");
        } else {
            info!(catalog = %name, "processing catalog");
            self.walk(&root, name, cancel, &mut report).await?;
        }

        self.rebuild_global_index()?;
        Ok(report)
    }

    fn catalog_dir(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        let dir = self.archive_dir.join(name);
        if !single_normal || !dir.is_dir() {
            return Err(CatalogError::CatalogNotFound(name.to_string()));
        }
        Ok(dir)
    }

    /// Depth-first pass over `root` with an explicit stack.
    async fn walk(
        &self,
        root: &Path,
        catalog: &str,
        cancel: &CancellationToken,
        report: &mut WalkReport,
    ) -> Result<()> {
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            if cancel.is_cancelled() {
                info!(catalog = %catalog, "walk cancelled");
                return Err(CatalogError::Cancelled);
            }
            if self.scanner().should_exclude(&dir) {
                debug!(dir = %dir.display(), "skipping excluded directory");
                continue;
            }

            match child_dirs(&dir) {
                // Reversed so siblings pop in name order.
                Ok(children) => stack.extend(children.into_iter().rev()),
                Err(e) => warn!(dir = %dir.display(), "cannot list subdirectories: {e}"),
            }

            match self.reconciler.reconcile(&dir, catalog, cancel).await {
                Ok(pass) => {
                    report.reconciled += 1;
                    report.analyzed += pass.analyzed;
                    report.analysis_failures += pass.failed;
                    if pass.has_data() {
                        report.with_data += 1;
                    }
                }
                Err(CatalogError::Cancelled) => return Err(CatalogError::Cancelled),
                Err(e) => {
                    warn!(dir = %dir.display(), "skipping directory: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Regenerate the root `index.json` and `index.md` from the directory
    /// indexes on disk. No images are analyzed.
    pub fn rebuild_global_index(&self) -> Result<GlobalIndex> {
        let mut global = GlobalIndex::new();
        let mut listed: Vec<String> = Vec::new();

        for name in self.catalog_names()? {
            let mut stack = vec![self.archive_dir.join(&name)];
            while let Some(dir) = stack.pop() {
                if self.scanner().should_exclude(&dir) {
                    continue;
                }
                if let Ok(children) = child_dirs(&dir) {
                    stack.extend(children);
                }

                let index_path = dir.join(INDEX_JSON);
                if is_file(&index_path) {
                    match self.scanner().load_existing_data(&index_path) {
                        Ok(index) if !index.is_empty() => {
                            global.merge(index.summary(name.as_str(), created_at(&dir)));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(dir = %dir.display(), "skipping unreadable index: {e}"),
                    }
                }
                if is_file(&dir.join(INDEX_MD)) {
                    listed.push(self.relative_name(&dir));
                }
            }
        }
        listed.sort();

        write_file_atomic(&self.archive_dir.join(INDEX_JSON), &global.to_json_pretty()?)?;
        if let Err(e) = write_file_atomic(&self.archive_dir.join(INDEX_MD), &render_root(&listed)) {
            warn!("failed to write root {INDEX_MD}: {e}");
        }

        info!(catalogs = global.len(), "global index rebuilt");
        Ok(global)
    }

    /// `/`-separated path of `dir` relative to the archive root.
    fn relative_name(&self, dir: &Path) -> String {
        let rel = dir.strip_prefix(&self.archive_dir).unwrap_or(dir);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl<A: Analyzer + 'static> ReindexHandler for CatalogWalker<A> {
    async fn reindex(&self, task: &ReindexTask, cancel: &CancellationToken) -> Result<()> {
        let report = match self.process_catalog(&task.catalog_name, cancel).await {
            Ok(report) => report,
            // A catalog removed from disk only needs to leave the global index.
            Err(CatalogError::CatalogNotFound(_)) => {
                info!(catalog = %task.catalog_name, "catalog no longer exists, refreshing global index");
                self.rebuild_global_index()?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        debug!(
            catalog = %task.catalog_name,
            directories = report.reconciled,
            analyzed = report.analyzed,
            "reindex pass complete"
        );
        Ok(())
    }
}

/// Direct subdirectories of `dir`, sorted. Symlinks are not followed.
fn child_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| CatalogError::storage("list", dir, e))?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    Ok(dirs)
}
