pub mod analysis;
pub mod commands;
pub mod config;
pub mod error;
pub mod exclude;
pub mod fs;
pub mod index;
pub mod queue;
pub mod reconciler;
pub mod scanner;
pub mod walker;
pub mod watcher;

pub use analysis::{Analysis, AnalysisError, Analyzer, VisionClient};
pub use config::Config;
pub use error::{CatalogError, Result};
pub use exclude::ExclusionMatcher;
pub use index::{CatalogSummary, DirectoryIndex, GlobalIndex, ImageRecord, RecordOutcome};
pub use queue::{ReindexHandler, ReindexTask, TaskQueue, TriggerSource};
pub use reconciler::{DirectoryReconciler, ReconcileReport};
pub use scanner::FileScanner;
pub use walker::{CatalogWalker, WalkReport};
pub use watcher::CatalogWatcher;
