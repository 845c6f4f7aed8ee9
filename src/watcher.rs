//! Filesystem watcher that turns image changes into reindex tasks.
//!
//! Watches the archive root recursively with `notify::RecommendedWatcher`,
//! bridges its callbacks into tokio through a bounded channel, and collects
//! the affected catalogs over a debounce window. Each catalog is enqueued at
//! most once per window.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CatalogError, Result};
use crate::fs::TEMP_SUFFIX;
use crate::index::is_reserved_name;
use crate::queue::{ReindexHandler, TaskQueue, TriggerSource};

/// Capacity of the channel bridging `notify` callbacks to the event loop.
/// When it is full, the next batch re-enqueues every catalog instead.
const CHANNEL_CAPACITY: usize = 512;

/// Watches an archive and feeds a [`TaskQueue`].
///
/// Dropping the watcher stops event delivery.
pub struct CatalogWatcher {
    task: JoinHandle<()>,
    // Dropping the notify watcher deregisters the OS watch.
    _watcher: notify::RecommendedWatcher,
}

impl CatalogWatcher {
    /// Start watching `archive_dir`.
    ///
    /// `extensions` are lowercase with a leading dot. Must be called from
    /// within a tokio runtime.
    pub fn start<H: ReindexHandler>(
        archive_dir: &Path,
        extensions: &[String],
        debounce: Duration,
        queue: Arc<TaskQueue<H>>,
    ) -> Result<Self> {
        let archive_dir = std::fs::canonicalize(archive_dir)
            .map_err(|e| CatalogError::storage("resolve", archive_dir, e))?;
        let (bridge_tx, bridge_rx) = mpsc::channel::<notify::Event>(CHANNEL_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut watcher = {
            let overflow = Arc::clone(&overflowed);
            notify::RecommendedWatcher::new(
                move |res: std::result::Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        if bridge_tx.try_send(event).is_err() && !overflow.swap(true, Ordering::Relaxed)
                        {
                            warn!(
                                "watcher channel full (capacity {CHANNEL_CAPACITY}), \
                                 falling back to a full reindex"
                            );
                        }
                    }
                    Err(e) => warn!("filesystem watcher error: {e}"),
                },
                notify::Config::default(),
            )
            .map_err(|e| CatalogError::Watcher(format!("failed to create filesystem watcher: {e}")))?
        };

        watcher
            .watch(&archive_dir, RecursiveMode::Recursive)
            .map_err(|e| {
                CatalogError::Watcher(format!("failed to watch {}: {e}", archive_dir.display()))
            })?;

        info!(archive = %archive_dir.display(), debounce_ms = debounce.as_millis() as u64, "watching for changes");

        let loop_state = EventLoop {
            archive_dir,
            extensions: extensions.to_vec(),
            debounce,
            overflowed,
        };
        let task = tokio::spawn(loop_state.run(bridge_rx, queue));

        Ok(Self {
            task,
            _watcher: watcher,
        })
    }

    /// Stop delivering events.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for CatalogWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct EventLoop {
    archive_dir: PathBuf,
    extensions: Vec<String>,
    debounce: Duration,
    overflowed: Arc<AtomicBool>,
}

impl EventLoop {
    async fn run<H: ReindexHandler>(
        self,
        mut events: mpsc::Receiver<notify::Event>,
        queue: Arc<TaskQueue<H>>,
    ) {
        let mut pending: BTreeSet<String> = BTreeSet::new();

        // Block until the first event of a window arrives.
        while let Some(event) = events.recv().await {
            self.accumulate(&mut pending, &event);

            let deadline = tokio::time::Instant::now() + self.debounce;
            let closed = loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(Some(event)) => self.accumulate(&mut pending, &event),
                    Ok(None) => break true,
                    Err(_) => break false,
                }
            };

            self.flush(&mut pending, &queue);
            if closed {
                break;
            }
        }
        debug!("watcher event loop exiting");
    }

    fn accumulate(&self, pending: &mut BTreeSet<String>, event: &notify::Event) {
        if !is_relevant(&event.kind) {
            return;
        }
        for path in &event.paths {
            if let Some(catalog) = catalog_for(&self.archive_dir, path, &self.extensions) {
                pending.insert(catalog);
            }
        }
    }

    fn flush<H: ReindexHandler>(&self, pending: &mut BTreeSet<String>, queue: &TaskQueue<H>) {
        if self.overflowed.swap(false, Ordering::Relaxed) {
            pending.extend(list_catalogs(&self.archive_dir));
        }
        for catalog in std::mem::take(pending) {
            debug!(catalog = %catalog, "change detected");
            queue.add_task(catalog, TriggerSource::Watcher);
        }
    }
}

/// Create, modify and remove events matter; access and metadata-only changes do not.
fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
        _ => false,
    }
}

/// Catalog affected by a change at `path`, if the change should trigger a reindex.
///
/// Index outputs and temp files never trigger. Files directly in the archive
/// root are not part of any catalog. Paths without an extension are taken to
/// be directories and trigger their catalog.
fn catalog_for(archive_dir: &Path, path: &Path, extensions: &[String]) -> Option<String> {
    let relative = path.strip_prefix(archive_dir).ok()?;
    let mut components = relative.components();
    let catalog = match components.next()? {
        Component::Normal(name) => name.to_string_lossy().into_owned(),
        _ => return None,
    };

    let file_name = path.file_name()?.to_string_lossy();
    if is_reserved_name(&file_name) || file_name.ends_with(TEMP_SUFFIX) {
        return None;
    }

    if let Some(ext) = path.extension() {
        let nested = components.next().is_some();
        let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
        if !nested || !extensions.contains(&ext) {
            return None;
        }
    }
    Some(catalog)
}

fn list_catalogs(archive_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(archive_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ReindexTask;
    use notify::event::{AccessKind, CreateKind, MetadataKind, RemoveKind};
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};
    use tokio_util::sync::CancellationToken;

    fn exts() -> Vec<String> {
        vec![".jpg".to_string(), ".png".to_string()]
    }

    #[derive(Default)]
    struct Recorder {
        seen: parking_lot::Mutex<Vec<(String, TriggerSource)>>,
    }

    impl Recorder {
        fn names(&self) -> Vec<String> {
            self.seen.lock().iter().map(|(n, _)| n.clone()).collect()
        }
    }

    impl ReindexHandler for Recorder {
        async fn reindex(&self, task: &ReindexTask, _cancel: &CancellationToken) -> Result<()> {
            self.seen
                .lock()
                .push((task.catalog_name.clone(), task.source));
            Ok(())
        }
    }

    fn running_queue() -> (Arc<TaskQueue<Recorder>>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&recorder), 16));
        queue.start();
        (queue, recorder)
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        timeout(Duration::from_secs(5), async {
            while recorder.seen.lock().len() < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expected reindex tasks were not delivered");
    }

    #[test]
    fn test_catalog_for() {
        let root = Path::new("/archive");
        let ext = exts();

        assert_eq!(
            catalog_for(root, Path::new("/archive/cats/a.jpg"), &ext).as_deref(),
            Some("cats")
        );
        assert_eq!(
            catalog_for(root, Path::new("/archive/cats/kittens/b.PNG"), &ext).as_deref(),
            Some("cats")
        );
        // Directory events.
        assert_eq!(
            catalog_for(root, Path::new("/archive/dogs"), &ext).as_deref(),
            Some("dogs")
        );
        assert_eq!(
            catalog_for(root, Path::new("/archive/dogs/2024"), &ext).as_deref(),
            Some("dogs")
        );

        assert_eq!(catalog_for(root, Path::new("/archive/cats/notes.txt"), &ext), None);
        assert_eq!(catalog_for(root, Path::new("/archive/cats/index.json"), &ext), None);
        assert_eq!(catalog_for(root, Path::new("/archive/cats/index.md"), &ext), None);
        assert_eq!(catalog_for(root, Path::new("/archive/cats/index.json.tmp"), &ext), None);
        assert_eq!(catalog_for(root, Path::new("/archive/loose.jpg"), &ext), None);
        assert_eq!(catalog_for(root, Path::new("/archive/index.json"), &ext), None);
        assert_eq!(catalog_for(root, Path::new("/elsewhere/cats/a.jpg"), &ext), None);
        assert_eq!(catalog_for(root, Path::new("/archive"), &ext), None);
    }

    #[test]
    fn test_is_relevant() {
        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant(&EventKind::Remove(RemoveKind::File)));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_relevant(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_relevant(&EventKind::Access(AccessKind::Any)));
        assert!(!is_relevant(&EventKind::Other));
    }

    #[tokio::test]
    async fn test_event_loop_coalesces_catalogs_per_window() {
        let (queue, recorder) = running_queue();
        let (tx, rx) = mpsc::channel(16);
        let event_loop = EventLoop {
            archive_dir: PathBuf::from("/archive"),
            extensions: exts(),
            debounce: Duration::from_millis(50),
            overflowed: Arc::new(AtomicBool::new(false)),
        };
        let handle = tokio::spawn(event_loop.run(rx, Arc::clone(&queue)));

        for path in [
            "/archive/cats/a.jpg",
            "/archive/cats/b.jpg",
            "/archive/dogs/c.png",
            "/archive/cats/index.json",
            "/archive/cats/a.jpg",
        ] {
            let event = notify::Event::new(EventKind::Create(CreateKind::File)).add_path(path.into());
            tx.send(event).await.unwrap();
        }
        let ignored = notify::Event::new(EventKind::Access(AccessKind::Any))
            .add_path("/archive/birds/x.jpg".into());
        tx.send(ignored).await.unwrap();

        wait_for(&recorder, 2).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.names(), vec!["cats", "dogs"]);
        assert!(
            recorder
                .seen
                .lock()
                .iter()
                .all(|(_, source)| *source == TriggerSource::Watcher)
        );

        drop(tx);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_overflow_reindexes_every_catalog() {
        let tmp = TempDir::new().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::create_dir(tmp.path().join(name)).unwrap();
        }
        let (queue, recorder) = running_queue();
        let (tx, rx) = mpsc::channel(4);
        let event_loop = EventLoop {
            archive_dir: tmp.path().to_path_buf(),
            extensions: exts(),
            debounce: Duration::from_millis(20),
            overflowed: Arc::new(AtomicBool::new(true)),
        };
        let handle = tokio::spawn(event_loop.run(rx, Arc::clone(&queue)));

        let event = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(tmp.path().join("a").join("x.jpg"));
        tx.send(event).await.unwrap();

        wait_for(&recorder, 3).await;
        let mut names = recorder.names();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);

        drop(tx);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_watcher_enqueues_catalog_on_new_image() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("cats")).unwrap();
        let (queue, recorder) = running_queue();

        let watcher = CatalogWatcher::start(
            tmp.path(),
            &exts(),
            Duration::from_millis(50),
            Arc::clone(&queue),
        )
        .unwrap();

        std::fs::write(tmp.path().join("cats").join("new.jpg"), b"img").unwrap();
        wait_for(&recorder, 1).await;
        assert_eq!(recorder.names()[0], "cats");

        watcher.stop();
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_start_missing_directory_fails() {
        let (queue, _recorder) = running_queue();
        let result = CatalogWatcher::start(
            Path::new("/nonexistent/archive/dir"),
            &exts(),
            Duration::from_millis(50),
            Arc::clone(&queue),
        );
        assert!(matches!(result, Err(CatalogError::Storage { .. })));
        queue.stop().await;
    }
}
