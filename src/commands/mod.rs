//! CLI command implementations.

mod config;
mod index;
mod process;
mod test_image;
mod watch;

pub use config::cmd_init_config;
pub use index::{cmd_list, cmd_rebuild_index};
pub use process::{cmd_catalog, cmd_process};
pub use test_image::cmd_test;
pub use watch::cmd_watch;

use std::path::Path;

use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analysis::VisionClient;
use crate::config::Config;
use crate::error::{CatalogError, Result};
use crate::walker::{CatalogWalker, WalkReport};

/// Walker backed by the configured vision endpoint.
pub(crate) fn build_walker(config: &Config, archive_dir: &Path) -> Result<CatalogWalker<VisionClient>> {
    if !archive_dir.is_dir() {
        return Err(CatalogError::Config(format!(
            "archive directory not found: {}",
            archive_dir.display()
        )));
    }
    let client = VisionClient::from_config(config)?;
    CatalogWalker::from_config(archive_dir, config, client)
}

/// Token cancelled on Ctrl-C (or SIGTERM on Unix).
pub(crate) fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal, finishing up");
        trigger.cancel();
    });
    token
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("cannot listen for SIGTERM: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// One-line summary of a walk for the terminal.
pub(crate) fn format_walk_report(report: &WalkReport) -> String {
    let mut line = format!(
        "{} {} director{} reconciled, {} image{} analyzed",
        "Done:".green().bold(),
        report.reconciled,
        if report.reconciled == 1 { "y" } else { "ies" },
        report.analyzed,
        if report.analyzed == 1 { "" } else { "s" },
    );
    if report.analysis_failures > 0 {
        line.push_str(&format!(
            ", {}",
            format!("{} failed (will retry)", report.analysis_failures).yellow()
        ));
    }
    if report.failed > 0 {
        line.push_str(&format!(
            ", {}",
            format!("{} director{} skipped", report.failed, if report.failed == 1 { "y" } else { "ies" })
                .red()
        ));
    }
    line
}
