//! Sync worker - turns triggers into sync cycles
//!
//! The [`SyncWorker`] owns the loop that drives the [`SyncEngine`]. A cycle
//! starts when the poll interval elapses or when something calls
//! [`SyncTrigger::request`]: the watcher ingestor after enqueueing changes,
//! the notification listener after a server push, or the user.
//!
//! ## Flow
//!
//! ```text
//! Ingestor ─────────┐
//! Notifications ────┼──→ SyncTrigger ──→ debounce ──→ SyncEngine::run_cycle
//! poll interval ────┘
//! ```
//!
//! Requests arriving while a cycle runs collapse into a single follow-up
//! cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{CycleReport, SyncEngine};
use crate::SyncError;

/// Shared handle used to ask for a sync cycle
#[derive(Debug, Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a cycle. Repeated requests before the worker wakes count once.
    pub fn request(&self) {
        self.notify.notify_one();
    }

    /// Waits for the next request
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Runs sync cycles on triggers and on a fixed interval
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    trigger: SyncTrigger,
    poll_interval: Duration,
    debounce_delay: Duration,
}

impl SyncWorker {
    pub fn new(
        engine: Arc<SyncEngine>,
        trigger: SyncTrigger,
        poll_interval: Duration,
        debounce_delay: Duration,
    ) -> Self {
        info!(
            poll_secs = poll_interval.as_secs(),
            debounce_ms = debounce_delay.as_millis() as u64,
            "Creating sync worker"
        );
        Self {
            engine,
            trigger,
            poll_interval,
            debounce_delay,
        }
    }

    /// Main loop
    ///
    /// Runs until `cancel` fires. Returns the error that halted the engine
    /// if a cycle hit a fatal error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        info!("Sync worker starting");

        let mut poll_timer = tokio::time::interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, sync worker stopping");
                    break;
                }
                _ = poll_timer.tick() => {
                    debug!("Poll interval elapsed");
                }
                _ = self.trigger.notified() => {
                    // Let a burst of events settle into one cycle
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Shutdown requested, sync worker stopping");
                            break;
                        }
                        _ = tokio::time::sleep(self.debounce_delay) => {}
                    }
                }
            }

            match self.engine.run_cycle(&cancel).await {
                Ok(report) => {
                    if report.more_pending && !cancel.is_cancelled() {
                        debug!("Server has more to send, scheduling another cycle");
                        self.trigger.request();
                    }
                }
                Err(err) => {
                    error!(error = %err, "Sync engine halted, worker stopping");
                    return Err(err);
                }
            }
        }

        info!("Sync worker stopped");
        Ok(())
    }

    /// Runs cycles back to back until nothing is left to exchange
    ///
    /// Used for one-shot syncs. Changes waiting for a retry delay are left
    /// for the next run.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport, SyncError> {
        let mut total = CycleReport::default();
        loop {
            let report = self.engine.run_cycle(cancel).await?;
            if !report.errors.is_empty() {
                warn!(errors = %report.errors, "Sync cycle finished with errors");
            }
            let again = report.ran && report.more_pending && !report.cancelled;
            total = merge_reports(total, report);
            if !again {
                return Ok(total);
            }
        }
    }
}

fn merge_reports(mut total: CycleReport, next: CycleReport) -> CycleReport {
    total.ran |= next.ran;
    total.cancelled |= next.cancelled;
    if next.sync_id.is_some() {
        total.sync_id = next.sync_id;
        total.generation = next.generation;
    }
    total.pushed += next.pushed;
    total.completed += next.completed;
    total.applied += next.applied;
    total.skipped_events += next.skipped_events;
    total.deferred += next.deferred;
    total.blocked += next.blocked;
    total.rejected += next.rejected;
    total.conflicts += next.conflicts;
    total.coalesced += next.coalesced;
    total.unchanged += next.unchanged;
    total.more_pending = next.more_pending;
    for err in next.errors {
        total.errors.push(err);
    }
    total.duration_ms += next.duration_ms;
    total
}
