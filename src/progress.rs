//! Progress bar driven by engine events.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use mss_core::download::{PageState, ProgressEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

/// Spawns the progress UI for `total` pages.
///
/// The task ends when the engine drops its sender. When `enabled` is false
/// events are drained without drawing, and failures are still logged.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    total: usize,
    mut events: UnboundedReceiver<ProgressEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = if enabled {
            let bar = ProgressBar::new(u64::try_from(total).unwrap_or(u64::MAX));
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            None
        };

        while let Some(event) = events.recv().await {
            if event.state == PageState::Failed {
                warn!(page_index = event.page_index, label = %event.label, "page failed");
            }
            if let Some(bar) = &bar {
                bar.set_position(u64::try_from(event.completed).unwrap_or(u64::MAX));
                bar.set_message(status_message(&event));
            }
        }

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
    })
}

fn status_message(event: &ProgressEvent) -> String {
    let last = format!("{} {}", event.label, event.state);
    if event.failures.is_empty() {
        last
    } else {
        format!("{last} ({} failing)", event.failures.len())
    }
}
