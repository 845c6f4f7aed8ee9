//! Sequential reindex queue.
//!
//! Reindex requests from the CLI, the watcher and startup all funnel into a
//! single worker task, so at most one catalog is reconciled at a time. The
//! buffer is bounded and never applies backpressure: when it is full, new
//! requests are dropped with a warning. Requests are idempotent, so a later
//! request for the same catalog covers a dropped one.

use std::fmt;
use std::sync::Arc;

use jiff::Timestamp;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CatalogError, Result};

/// Default number of buffered tasks.
pub const DEFAULT_CAPACITY: usize = 100;

/// What asked for a reindex. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerSource {
    Manual,
    Watcher,
    Startup,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Watcher => "watcher",
            TriggerSource::Startup => "startup",
        };
        f.write_str(s)
    }
}

/// A request to reconcile one catalog.
#[derive(Debug, Clone)]
pub struct ReindexTask {
    pub catalog_name: String,
    pub source: TriggerSource,
    pub created_at: Timestamp,
}

/// Work performed by the queue worker for each task.
pub trait ReindexHandler: Send + Sync + 'static {
    /// Reconcile `task.catalog_name`. Must return promptly once `cancel` fires.
    fn reindex(
        &self,
        task: &ReindexTask,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

enum QueueState {
    Stopped,
    Running {
        sender: mpsc::Sender<ReindexTask>,
        cancel: CancellationToken,
        worker: JoinHandle<()>,
    },
}

/// Bounded single-consumer reindex queue.
pub struct TaskQueue<H> {
    handler: Arc<H>,
    capacity: usize,
    state: Mutex<QueueState>,
}

impl<H: ReindexHandler> TaskQueue<H> {
    pub fn new(handler: Arc<H>, capacity: usize) -> Self {
        Self {
            handler,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::Stopped),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), QueueState::Running { .. })
    }

    /// Spawn the worker. Calling this on a running queue does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if matches!(*state, QueueState::Running { .. }) {
            return;
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            Arc::clone(&self.handler),
            receiver,
            cancel.clone(),
        ));
        *state = QueueState::Running {
            sender,
            cancel,
            worker,
        };
        info!(capacity = self.capacity, "task queue started");
    }

    /// Cancel the worker and wait for it to exit.
    ///
    /// The task in progress observes the cancellation and abandons its
    /// pass; buffered tasks are discarded. Stopping a stopped queue does
    /// nothing.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), QueueState::Stopped);
        let QueueState::Running {
            sender,
            cancel,
            worker,
        } = previous
        else {
            return;
        };

        cancel.cancel();
        drop(sender);
        if let Err(e) = worker.await {
            error!("task queue worker panicked: {e}");
        }
        info!("task queue stopped");
    }

    /// Enqueue a reindex of `catalog_name` without waiting.
    ///
    /// Returns `false` when the task was not accepted: the queue is stopped
    /// or its buffer is full.
    pub fn add_task(&self, catalog_name: impl Into<String>, source: TriggerSource) -> bool {
        let task = ReindexTask {
            catalog_name: catalog_name.into(),
            source,
            created_at: Timestamp::now(),
        };

        let state = self.state.lock();
        let QueueState::Running { sender, .. } = &*state else {
            debug!(catalog = %task.catalog_name, %source, "task queue is stopped, ignoring task");
            return false;
        };

        match sender.try_send(task) {
            Ok(()) => {
                debug!(%source, "reindex task queued");
                true
            }
            Err(TrySendError::Full(task)) => {
                warn!(
                    catalog = %task.catalog_name,
                    %source,
                    "task queue is full, dropping reindex task"
                );
                false
            }
            Err(TrySendError::Closed(task)) => {
                warn!(catalog = %task.catalog_name, "task queue worker has exited, dropping task");
                false
            }
        }
    }
}

impl<H> Drop for TaskQueue<H> {
    fn drop(&mut self) {
        if let QueueState::Running { cancel, .. } = &*self.state.lock() {
            cancel.cancel();
        }
    }
}

async fn run_worker<H: ReindexHandler>(
    handler: Arc<H>,
    mut receiver: mpsc::Receiver<ReindexTask>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        info!(catalog = %task.catalog_name, source = %task.source, "reindexing catalog");
        match handler.reindex(&task, &cancel).await {
            Ok(()) => info!(catalog = %task.catalog_name, "catalog reindexed"),
            Err(CatalogError::Cancelled) => {
                info!(catalog = %task.catalog_name, "reindex cancelled");
                break;
            }
            Err(e) => error!(catalog = %task.catalog_name, "reindex failed: {e}"),
        }
    }
    debug!("task queue worker exiting");
}
