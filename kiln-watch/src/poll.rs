//! Stat-polling change notifier.
//!
//! A background task stats every watched path once per interval and
//! publishes the difference against the previous poll. The first poll of a
//! newly watched path publishes its current metadata so that anything
//! cached before the baseline was taken gets corrected.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use kiln_core::{ConfigError, FileStat, KilnError, KilnResult, StorageError};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::notifier::{ChangeEvent, ChangeNotifier, EventHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Pending,
    Present(FileStat),
    Missing,
}

#[derive(Debug)]
struct PollState {
    hub: EventHub,
    watched: RwLock<BTreeMap<PathBuf, Observed>>,
}

/// [`ChangeNotifier`] that polls file metadata on a fixed interval.
#[derive(Debug)]
pub struct PollingNotifier {
    state: Arc<PollState>,
    shutdown_tx: watch::Sender<bool>,
    interval: Duration,
}

impl PollingNotifier {
    /// Start the polling task on the current Tokio runtime.
    pub fn spawn(poll_interval: Duration) -> KilnResult<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            KilnError::Config(ConfigError::InvalidValue {
                field: "runtime".to_string(),
                value: "none".to_string(),
                reason: e.to_string(),
            })
        })?;
        if poll_interval.is_zero() {
            return Err(KilnError::Config(ConfigError::InvalidValue {
                field: "poll_interval_ms".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            }));
        }

        let state = Arc::new(PollState {
            hub: EventHub::new(),
            watched: RwLock::new(BTreeMap::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        handle.spawn(poll_task(state.clone(), poll_interval, shutdown_rx));

        Ok(Self {
            state,
            shutdown_tx,
            interval: poll_interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl ChangeNotifier for PollingNotifier {
    fn watch(&self, paths: &[PathBuf]) -> KilnResult<()> {
        let mut watched = self
            .state
            .watched
            .write()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?;
        for path in paths {
            watched.entry(path.clone()).or_insert(Observed::Pending);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.state.hub.subscribe()
    }

    fn watched(&self) -> KilnResult<Vec<PathBuf>> {
        Ok(self
            .state
            .watched
            .read()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
            .keys()
            .cloned()
            .collect())
    }

    fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.state.hub.close();
    }

    fn is_closed(&self) -> bool {
        self.state.hub.is_closed()
    }
}

impl Drop for PollingNotifier {
    fn drop(&mut self) {
        self.close();
    }
}

async fn poll_task(
    state: Arc<PollState>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(interval_ms = poll_interval.as_millis() as u64, "Polling notifier started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = poll_once(&state).await {
                    tracing::warn!(error = %e, "Polling notifier cycle failed");
                }
            }
        }
    }

    tracing::debug!("Polling notifier stopped");
}

async fn poll_once(state: &PollState) -> KilnResult<()> {
    let snapshot: Vec<(PathBuf, Observed)> = state
        .watched
        .read()
        .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
        .iter()
        .map(|(path, observed)| (path.clone(), *observed))
        .collect();

    for (path, previous) in snapshot {
        let current = match tokio::fs::metadata(&path).await {
            Ok(meta) => match FileStat::from_metadata(&meta) {
                Ok(stat) => Observed::Present(stat),
                Err(_) => continue,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Observed::Missing,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable watched path");
                continue;
            }
        };

        let event = match (previous, current) {
            (Observed::Pending, Observed::Present(stat)) => Some(ChangeEvent::Changed {
                path: path.clone(),
                stat,
            }),
            (Observed::Present(old), Observed::Present(stat)) if old != stat => {
                Some(ChangeEvent::Changed {
                    path: path.clone(),
                    stat,
                })
            }
            (Observed::Present(_), Observed::Missing) => {
                Some(ChangeEvent::Removed { path: path.clone() })
            }
            (Observed::Missing, Observed::Present(_)) => {
                Some(ChangeEvent::Added { path: path.clone() })
            }
            _ => None,
        };

        state
            .watched
            .write()
            .map_err(|_| KilnError::Storage(StorageError::LockPoisoned))?
            .insert(path, current);

        if let Some(event) = event {
            state.hub.send(event);
        }
    }
    Ok(())
}
