//! Background snapshot task
//!
//! The task watches the manager's `watch` channel and writes a snapshot:
//! - on every interval tick
//! - after a state change, once changes have been quiet for `debounce`
//!   (bounded by `interval` so a steady stream of changes still persists)
//! - once more on shutdown
//!
//! It only ever sees channel copies of the state, never the manager's lock,
//! and write failures are logged, never propagated.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::store::SharedSessionStore;
use super::types::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub interval: Duration,
    pub debounce: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            debounce: Duration::from_millis(500),
        }
    }
}

/// Counters reported when the task stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutosaveStats {
    pub snapshots: u64,
    pub failures: u64,
}

/// Handle to a running autosave task.
pub struct AutosaveHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<AutosaveStats>,
}

impl AutosaveHandle {
    /// Write a final snapshot and wait for the task to finish.
    pub async fn shutdown(self) -> AutosaveStats {
        let _ = self.shutdown.send(()).await;
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Autosave task panicked");
                AutosaveStats::default()
            }
        }
    }
}

/// Start the autosave task on the current runtime.
pub fn spawn_autosave(
    store: SharedSessionStore,
    mut receiver: watch::Receiver<SessionState>,
    config: AutosaveConfig,
) -> AutosaveHandle {
    let (shutdown, mut shutdown_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut stats = AutosaveStats::default();
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            path = %store.path().display(),
            interval_secs = config.interval.as_secs(),
            debounce_ms = config.debounce.as_millis() as u64,
            "Session autosave started"
        );

        'run: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break 'run,
                _ = ticker.tick() => {
                    let state = receiver.borrow_and_update().clone();
                    write_snapshot(&store, state, &mut stats).await;
                }
                changed = receiver.changed() => {
                    if changed.is_err() {
                        debug!("Session state publisher dropped; stopping autosave");
                        break 'run;
                    }

                    let settle_by = Instant::now() + config.interval;
                    let mut stopping = false;
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(config.debounce) => break,
                            _ = tokio::time::sleep_until(settle_by) => break,
                            changed = receiver.changed() => {
                                if changed.is_err() {
                                    stopping = true;
                                    break;
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                stopping = true;
                                break;
                            }
                        }
                    }
                    if stopping {
                        break 'run;
                    }

                    let state = receiver.borrow_and_update().clone();
                    write_snapshot(&store, state, &mut stats).await;
                    ticker.reset();
                }
            }
        }

        let state = receiver.borrow().clone();
        write_snapshot(&store, state, &mut stats).await;
        info!(
            snapshots = stats.snapshots,
            failures = stats.failures,
            "Session autosave stopped"
        );
        stats
    });

    AutosaveHandle { shutdown, task }
}

async fn write_snapshot(store: &SharedSessionStore, state: SessionState, stats: &mut AutosaveStats) {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.snapshot(&state)).await {
        Ok(Ok(())) => stats.snapshots += 1,
        Ok(Err(e)) => {
            stats.failures += 1;
            warn!(error = %e, "Session snapshot failed");
        }
        Err(e) => {
            stats.failures += 1;
            error!(error = %e, "Session snapshot task failed");
        }
    }
}
