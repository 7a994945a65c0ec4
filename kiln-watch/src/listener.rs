//! Event listener feeding the stat tracker.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::notifier::ChangeEvent;
use crate::stat::StatTracker;

/// Apply notifier events to `tracker` until shutdown or until the channel
/// closes.
///
/// A lagging receiver has lost events, so every cached stat becomes suspect
/// and the tracker is cleared.
pub fn spawn_listener(
    tracker: Arc<StatTracker>,
    mut events: broadcast::Receiver<ChangeEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = tracker.apply(&event) {
                            tracing::warn!(error = %e, path = %event.path().display(), "Failed to apply change event");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Change listener lagged, clearing stat cache");
                        if let Err(e) = tracker.clear() {
                            tracing::warn!(error = %e, "Failed to clear stat cache");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Change listener stopped");
    })
}
