//! Single-directory reconciliation.
//!
//! One pass brings a directory's `index.json` in line with the images on
//! disk: records of deleted files are dropped, new and previously failed
//! images are analyzed with at most `parallel_requests` calls in flight, and
//! the index plus its Markdown view are written back. A cancelled pass
//! writes nothing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::{Analysis, AnalysisError, Analyzer, analyze_file};
use crate::config::Config;
use crate::error::{CatalogError, Result};
use crate::fs::{created_at, is_file, remove_file_if_exists, write_file_atomic};
use crate::index::markdown::render_directory;
use crate::index::{CatalogSummary, ERROR_SHORT_NAME, INDEX_JSON, INDEX_MD, ImageRecord, now};
use crate::scanner::FileScanner;

/// What one reconciliation pass did to a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Summary of the persisted index; `None` when the directory has no data.
    pub summary: Option<CatalogSummary>,
    /// Images sent to the analyzer in this pass.
    pub analyzed: usize,
    /// Analyses that failed and were recorded for retry.
    pub failed: usize,
    /// Records dropped because their file is gone.
    pub removed: usize,
}

impl ReconcileReport {
    pub fn has_data(&self) -> bool {
        self.summary.is_some()
    }
}

/// Converges a directory index with its file listing.
pub struct DirectoryReconciler<A> {
    scanner: FileScanner,
    analyzer: Arc<A>,
    prompt: Arc<str>,
    parallel_requests: usize,
}

impl<A: Analyzer + 'static> DirectoryReconciler<A> {
    /// Fails if `parallel_requests` is zero.
    pub fn new(
        scanner: FileScanner,
        analyzer: A,
        prompt: impl Into<String>,
        parallel_requests: usize,
    ) -> Result<Self> {
        if parallel_requests == 0 {
            return Err(CatalogError::Config(
                "parallel_requests must be positive".to_string(),
            ));
        }
        Ok(Self {
            scanner,
            analyzer: Arc::new(analyzer),
            prompt: Arc::from(prompt.into()),
            parallel_requests,
        })
    }

    /// Reconciler for directories under `archive_dir`.
    pub fn from_config(config: &Config, archive_dir: &Path, analyzer: A) -> Result<Self> {
        Self::new(
            FileScanner::from_config(config, archive_dir)?,
            analyzer,
            config.user_prompt.clone(),
            config.parallel_requests,
        )
    }

    pub fn scanner(&self) -> &FileScanner {
        &self.scanner
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    /// Run one pass over `dir`, summarizing it under `name`.
    pub async fn reconcile(
        &self,
        dir: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        if cancel.is_cancelled() {
            return Err(CatalogError::Cancelled);
        }

        let index_path = dir.join(INDEX_JSON);
        let md_path = dir.join(INDEX_MD);

        let mut index = self.scanner.load_existing_data(&index_path)?;
        let images = self.scanner.find_images_to_process(dir)?;
        let present: BTreeSet<String> = images.iter().filter_map(|p| file_name(p)).collect();

        let removed = index.retain_present(&present);
        for filename in &removed {
            debug!(dir = %dir.display(), file = %filename, "dropping record of deleted image");
        }

        let pending: Vec<(String, PathBuf)> = images
            .into_iter()
            .filter_map(|path| file_name(&path).map(|name| (name, path)))
            .filter(|(filename, _)| index.needs_processing(filename))
            .collect();

        for (filename, _) in &pending {
            if index.get(filename).is_some_and(ImageRecord::is_failed) {
                info!(dir = %dir.display(), file = %filename, "RETRY: re-analyzing previously failed image");
            } else {
                info!(dir = %dir.display(), file = %filename, "analyzing new image");
            }
        }

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(dir = %dir.display(), "reconciliation cancelled, discarding pass");
                return Err(CatalogError::Cancelled);
            }
            results = self.dispatch(pending) => results,
        };

        let mut report = ReconcileReport {
            analyzed: results.len(),
            removed: removed.len(),
            ..ReconcileReport::default()
        };
        let changed = !removed.is_empty() || !results.is_empty();

        for (filename, result) in results {
            let record = match result {
                Ok(analysis) => {
                    if analysis.short_name == ERROR_SHORT_NAME {
                        warn!(
                            file = %filename,
                            "model returned the failure marker as a short name; the image will be retried"
                        );
                    }
                    ImageRecord::analyzed(
                        filename.as_str(),
                        analysis.short_name,
                        analysis.description,
                        analysis.model_id,
                        now(),
                    )
                }
                Err(e) => {
                    warn!(dir = %dir.display(), file = %filename, "analysis failed: {e}");
                    report.failed += 1;
                    ImageRecord::failed(filename.as_str(), e.to_string(), now())
                }
            };
            index.insert(filename, record);
        }

        if index.is_empty() {
            let json_removed = remove_file_if_exists(&index_path)?;
            let md_removed = remove_file_if_exists(&md_path)?;
            if json_removed || md_removed {
                info!(dir = %dir.display(), "no images left, removed index files");
            }
            return Ok(report);
        }

        if changed || !is_file(&index_path) {
            write_file_atomic(&index_path, &index.to_json_pretty()?)?;
        }
        if changed || !is_file(&md_path) {
            // The Markdown view is presentational only.
            if let Err(e) = write_file_atomic(&md_path, &render_directory(&index)) {
                warn!(dir = %dir.display(), "failed to write {INDEX_MD}: {e}");
            }
        }

        report.summary = Some(index.summary(name, created_at(dir)));
        info!(
            dir = %dir.display(),
            images = index.len(),
            analyzed = report.analyzed,
            failed = report.failed,
            removed = report.removed,
            "directory reconciled"
        );
        Ok(report)
    }

    /// Analyze `pending` images with bounded concurrency.
    async fn dispatch(
        &self,
        pending: Vec<(String, PathBuf)>,
    ) -> Vec<(String, std::result::Result<Analysis, AnalysisError>)> {
        stream::iter(pending)
            .map(|(filename, path)| {
                let analyzer = Arc::clone(&self.analyzer);
                let prompt = Arc::clone(&self.prompt);
                async move {
                    let result = analyze_file(analyzer.as_ref(), &path, &prompt).await;
                    (filename, result)
                }
            })
            .buffer_unordered(self.parallel_requests)
            .collect()
            .await
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analysis::fixtures::{tag_of, tagged_png};
    use crate::exclude::ExclusionMatcher;
    use crate::index::{DirectoryIndex, RecordOutcome};
    use std::collections::HashSet;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Counts calls and tracks the peak number in flight.
    #[derive(Default)]
    pub(crate) struct FakeAnalyzer {
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        /// Images whose tag is one of these fail.
        pub failing: HashSet<String>,
        pub delay: Duration,
    }

    impl FakeAnalyzer {
        pub fn failing_on(tag: &str) -> Self {
            Self {
                failing: [tag.to_string()].into(),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Analyzer for FakeAnalyzer {
        async fn analyze(
            &self,
            image: &[u8],
            _media_type: &str,
            _prompt: &str,
        ) -> std::result::Result<Analysis, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let text = tag_of(image);
            if self.failing.contains(&text) {
                return Err(AnalysisError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(Analysis {
                short_name: format!("name of {text}"),
                description: format!("description of {text}"),
                model_id: "fake-model".to_string(),
            })
        }
    }

    fn reconciler(analyzer: FakeAnalyzer, parallel: usize) -> DirectoryReconciler<FakeAnalyzer> {
        let scanner = FileScanner::new(&[".jpg", ".png"], ExclusionMatcher::default());
        DirectoryReconciler::new(scanner, analyzer, "describe", parallel).unwrap()
    }

    fn write_images(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), tagged_png(name)).unwrap();
        }
    }

    fn load(dir: &Path) -> DirectoryIndex {
        DirectoryIndex::from_json(&fs::read_to_string(dir.join(INDEX_JSON)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_directory() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg", "b.jpg"]);
        let r = reconciler(FakeAnalyzer::default(), 3);

        let report = r
            .reconcile(tmp.path(), "cats", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.analyzed, 2);
        assert_eq!(report.failed, 0);
        let summary = report.summary.unwrap();
        assert_eq!(summary.name, "cats");
        assert_eq!(summary.image_count, 2);

        let index = load(tmp.path());
        assert_eq!(index.len(), 2);
        let a = index.get("a.jpg").unwrap();
        assert_eq!(a.short_name(), "name of a.jpg");
        assert_eq!(a.description(), "description of a.jpg");
        assert_eq!(a.original_name, "a.jpg");
        assert_eq!(a.model_id, "fake-model");
        assert!(a.updated_at.is_some());

        let md = fs::read_to_string(tmp.path().join(INDEX_MD)).unwrap();
        assert!(md.contains("| [name of b.jpg](b.jpg) | description of b.jpg |"));
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg", "b.png"]);
        let r = reconciler(FakeAnalyzer::default(), 2);
        let cancel = CancellationToken::new();

        r.reconcile(tmp.path(), "c", &cancel).await.unwrap();
        let first = fs::read_to_string(tmp.path().join(INDEX_JSON)).unwrap();
        assert_eq!(r.analyzer().calls(), 2);

        let report = r.reconcile(tmp.path(), "c", &cancel).await.unwrap();
        let second = fs::read_to_string(tmp.path().join(INDEX_JSON)).unwrap();

        assert_eq!(r.analyzer().calls(), 2);
        assert_eq!(report.analyzed, 0);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_deleted_images_are_dropped() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg", "b.jpg"]);
        let r = reconciler(FakeAnalyzer::default(), 2);
        let cancel = CancellationToken::new();
        r.reconcile(tmp.path(), "c", &cancel).await.unwrap();

        fs::remove_file(tmp.path().join("a.jpg")).unwrap();
        let report = r.reconcile(tmp.path(), "c", &cancel).await.unwrap();

        assert_eq!(report.removed, 1);
        let index = load(tmp.path());
        assert!(!index.contains("a.jpg"));
        assert!(index.contains("b.jpg"));
        assert!(!fs::read_to_string(tmp.path().join(INDEX_MD)).unwrap().contains("a.jpg"));
    }

    #[tokio::test]
    async fn test_empty_index_removes_files() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg"]);
        let r = reconciler(FakeAnalyzer::default(), 1);
        let cancel = CancellationToken::new();
        r.reconcile(tmp.path(), "c", &cancel).await.unwrap();
        assert!(tmp.path().join(INDEX_JSON).exists());

        fs::remove_file(tmp.path().join("a.jpg")).unwrap();
        let report = r.reconcile(tmp.path(), "c", &cancel).await.unwrap();

        assert!(!report.has_data());
        assert!(!tmp.path().join(INDEX_JSON).exists());
        assert!(!tmp.path().join(INDEX_MD).exists());
    }

    #[tokio::test]
    async fn test_directory_without_images_has_no_data() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("readme.txt"), "hi").unwrap();
        let r = reconciler(FakeAnalyzer::default(), 1);
        let report = r
            .reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.has_data());
        assert!(!tmp.path().join(INDEX_JSON).exists());
        assert_eq!(r.analyzer().calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_siblings_persist() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["good1.jpg", "bad.jpg", "good2.jpg"]);
        let r = reconciler(FakeAnalyzer::failing_on("bad.jpg"), 2);

        let report = r
            .reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        let index = load(tmp.path());
        assert_eq!(index.len(), 3);
        assert!(!index.get("good1.jpg").unwrap().is_failed());
        assert!(!index.get("good2.jpg").unwrap().is_failed());

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(tmp.path().join(INDEX_JSON)).unwrap())
                .unwrap();
        assert_eq!(raw["bad.jpg"]["short_name"], "error_processing");
        assert_eq!(raw["bad.jpg"]["vl_model"], "unknown");
    }

    #[tokio::test]
    async fn test_failed_records_are_retried() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg", "b.jpg"]);
        // A sentinel written by an older version, plus a good record.
        fs::write(
            tmp.path().join(INDEX_JSON),
            r#"{
                "a.jpg": {"short_name": "error_processing", "description": "Error processing file (retry will be attempted)",
                          "original_name": "a.jpg", "vl_model": "unknown", "update_date": "2024-01-01T00:00:00Z"},
                "b.jpg": {"short_name": "Kept", "description": "Keep me",
                          "original_name": "b.jpg", "vl_model": "old", "update_date": "2024-01-01T00:00:00Z"}
            }"#,
        )
        .unwrap();

        let r = reconciler(FakeAnalyzer::default(), 2);
        let report = r
            .reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(r.analyzer().calls(), 1);
        assert_eq!(report.analyzed, 1);
        let index = load(tmp.path());
        assert_eq!(index.get("a.jpg").unwrap().short_name(), "name of a.jpg");
        assert_eq!(index.get("b.jpg").unwrap().short_name(), "Kept");
        assert_eq!(index.get("b.jpg").unwrap().model_id, "old");
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let tmp = TempDir::new().unwrap();
        let names: Vec<String> = (0..12).map(|i| format!("img{i:02}.jpg")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        write_images(tmp.path(), &refs);

        let analyzer = FakeAnalyzer {
            delay: Duration::from_millis(20),
            ..FakeAnalyzer::default()
        };
        let r = reconciler(analyzer, 3);
        r.reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(r.analyzer().calls(), 12);
        let peak = r.analyzer().max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in flight was {peak}");
        assert!(peak >= 2, "expected some parallelism, peak was {peak}");
    }

    #[tokio::test]
    async fn test_corrupted_index_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg"]);
        fs::write(tmp.path().join(INDEX_JSON), "{{{ garbage").unwrap();

        let r = reconciler(FakeAnalyzer::default(), 1);
        r.reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(load(tmp.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_markdown_is_regenerated() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg"]);
        let r = reconciler(FakeAnalyzer::default(), 1);
        let cancel = CancellationToken::new();
        r.reconcile(tmp.path(), "c", &cancel).await.unwrap();

        fs::remove_file(tmp.path().join(INDEX_MD)).unwrap();
        r.reconcile(tmp.path(), "c", &cancel).await.unwrap();

        assert!(tmp.path().join(INDEX_MD).exists());
        assert_eq!(r.analyzer().calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_record_keys_survive_a_pass() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg", "new.jpg"]);
        fs::write(
            tmp.path().join(INDEX_JSON),
            r#"{"a.jpg": {"short_name": "A", "description": "d", "original_name": "a.jpg",
                          "vl_model": "m", "update_date": "2024-01-01T00:00:00Z", "tags": ["x"]}}"#,
        )
        .unwrap();

        let r = reconciler(FakeAnalyzer::default(), 1);
        r.reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(tmp.path().join(INDEX_JSON)).unwrap())
                .unwrap();
        assert_eq!(raw["a.jpg"]["tags"], serde_json::json!(["x"]));
        assert!(raw["new.jpg"].is_object());
    }

    #[tokio::test]
    async fn test_cancelled_pass_persists_nothing() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg", "b.jpg"]);
        let analyzer = FakeAnalyzer {
            delay: Duration::from_secs(10),
            ..FakeAnalyzer::default()
        };
        let r = reconciler(analyzer, 2);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = r.reconcile(tmp.path(), "c", &cancel).await.unwrap_err();
        assert!(matches!(err, CatalogError::Cancelled));
        assert!(!tmp.path().join(INDEX_JSON).exists());
        assert!(!tmp.path().join(INDEX_MD).exists());
    }

    #[tokio::test]
    async fn test_already_cancelled_does_nothing() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg"]);
        let r = reconciler(FakeAnalyzer::default(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(r.reconcile(tmp.path(), "c", &cancel).await.is_err());
        assert_eq!(r.analyzer().calls(), 0);
    }

    #[tokio::test]
    async fn test_mistyped_record_does_not_discard_its_siblings() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["a.jpg", "b.jpg", "c.jpg"]);
        fs::write(
            tmp.path().join(INDEX_JSON),
            r#"{
                "a.jpg": {"short_name": "A", "description": "first", "original_name": "a.jpg",
                          "vl_model": "m", "update_date": "2024-01-01T00:00:00Z", "tags": ["x"]},
                "b.jpg": {"short_name": "B", "description": "second", "original_name": "b.jpg",
                          "vl_model": "m", "update_date": "2024-01-01T00:00:00Z"},
                "c.jpg": {"short_name": "C", "description": null, "original_name": "c.jpg",
                          "vl_model": "m", "update_date": 1700000000},
                "d.jpg": "left over"
            }"#,
        )
        .unwrap();
        write_images(tmp.path(), &["d.jpg"]);

        let r = reconciler(FakeAnalyzer::default(), 2);
        r.reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();

        // Only the non-object entry is analyzed again.
        assert_eq!(r.analyzer().calls(), 1);
        let index = load(tmp.path());
        assert_eq!(index.get("a.jpg").unwrap().short_name(), "A");
        assert_eq!(index.get("b.jpg").unwrap().description(), "second");
        assert_eq!(index.get("c.jpg").unwrap().short_name(), "C");
        assert_eq!(index.get("d.jpg").unwrap().short_name(), "name of d.jpg");

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(tmp.path().join(INDEX_JSON)).unwrap())
                .unwrap();
        assert_eq!(raw["a.jpg"]["tags"], serde_json::json!(["x"]));
    }

    #[tokio::test]
    async fn test_undecodable_image_is_recorded_without_a_call() {
        let tmp = TempDir::new().unwrap();
        write_images(tmp.path(), &["good.jpg"]);
        fs::write(tmp.path().join("broken.jpg"), b"truncated").unwrap();

        let r = reconciler(FakeAnalyzer::default(), 2);
        let report = r
            .reconcile(tmp.path(), "c", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(r.analyzer().calls(), 1);
        assert_eq!(report.failed, 1);
        let index = load(tmp.path());
        assert!(index.get("broken.jpg").unwrap().is_failed());
        assert!(!index.get("good.jpg").unwrap().is_failed());
    }

    #[test]
    fn test_zero_parallel_requests_rejected() {
        let scanner = FileScanner::new(&[".jpg"], ExclusionMatcher::default());
        let result = DirectoryReconciler::new(scanner, FakeAnalyzer::default(), "p", 0);
        assert!(matches!(result, Err(CatalogError::Config(_))));
    }

    #[test]
    fn test_failed_outcome_keeps_reason() {
        let record = ImageRecord::failed("a.jpg", "API returned HTTP 500: boom", now());
        assert_eq!(
            record.outcome,
            RecordOutcome::Failed {
                reason: "API returned HTTP 500: boom".to_string()
            }
        );
    }
}
