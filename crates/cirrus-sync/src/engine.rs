//! Synchronization engine
//!
//! The [`SyncEngine`] runs one sync cycle at a time:
//!
//! ```text
//! Idle → Gathering → Merging → Pushing ──────────→ Applying → Committing → Idle
//!            │                                        ▲
//!            └──(no local changes)── AwaitingServer ──┘
//!
//! Failed is reachable from every state and always returns to Idle.
//! ```
//!
//! 1. **Gathering**: drain the change queue and the due failures, resolve
//!    dependencies. Blocked changes go back to the front of the queue,
//!    malformed ones are dropped.
//! 2. **Merging**: merge the ready batch into the local index. Conflicts
//!    move to the failure set and hold back their dependents.
//! 3. **Pushing**: Sync_To with the merged batch and the last sync id.
//! 4. **AwaitingServer**: with nothing to push, Sync_From carrying only the
//!    last sync id, repeated while the server reports a partial response.
//! 5. **Applying**: retry server events deferred by earlier cycles, then
//!    update the index for each new server event, then the filesystem.
//!    Acknowledgements of our own changes only touch the index.
//! 6. **Committing**: advance the cursor and retire acknowledged changes.
//!
//! ## Error handling
//!
//! Network failures send the whole batch to the failure set with backoff.
//! Server rejections and unacknowledged changes are retried individually.
//! Filesystem apply errors are caught per event and the event is deferred,
//! so the cursor can move on without losing it. A foreign event on a path
//! whose local change is still unconfirmed is a conflict: it is deferred
//! until the local change settles. Index errors are fatal and halt the
//! engine.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use cirrus_core::config::Config;
use cirrus_core::domain::{
    ChangeId, ChangeKind, ChangeState, ClientId, FailureReason, FailureSet, FileChange,
    ServerEvent, SyncId,
};
use cirrus_core::ports::{
    EventOrigin, IFilesystemApplier, ILocalIndex, IRemoteService, MetadataQuery, PullRequest,
    PushRequest, PushResponse, RemoteError, WireChange,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::echo::EchoSuppressor;
use crate::queue::ChangeQueue;
use crate::resolver::{DependencyResolver, Resolution};
use crate::{CompositeError, SyncError};

// ============================================================================
// Error classification
// ============================================================================

/// Determines whether an error is transient (retryable)
///
/// Used for errors that do not carry a [`RemoteError`]. Transient errors
/// include network failures, rate limiting and 5xx responses.
fn is_transient_error(err: &anyhow::Error) -> bool {
    let err_str = format!("{err:#}").to_lowercase();

    // Network errors
    if err_str.contains("network")
        || err_str.contains("connection")
        || err_str.contains("timeout")
        || err_str.contains("timed out")
        || err_str.contains("dns")
        || err_str.contains("reset by peer")
        || err_str.contains("broken pipe")
    {
        return true;
    }

    // Rate limiting
    if err_str.contains("429")
        || err_str.contains("too many requests")
        || err_str.contains("rate limit")
    {
        return true;
    }

    // Server errors (5xx)
    if err_str.contains("500")
        || err_str.contains("502")
        || err_str.contains("503")
        || err_str.contains("504")
        || err_str.contains("server error")
    {
        return true;
    }

    false
}

/// Maps a remote-service failure onto the sync error taxonomy
fn classify_remote_error(err: &anyhow::Error) -> SyncError {
    if let Some(remote) = err.downcast_ref::<RemoteError>() {
        return if remote.is_transient() {
            SyncError::Transient(remote.to_string())
        } else {
            SyncError::Conflict(remote.to_string())
        };
    }
    if is_transient_error(err) {
        SyncError::Transient(format!("{err:#}"))
    } else {
        SyncError::Conflict(format!("{err:#}"))
    }
}

fn index_failure(operation: &'static str) -> impl FnOnce(anyhow::Error) -> SyncError {
    move |err| SyncError::Fatal(format!("Index {operation} failed: {err:#}"))
}

// ============================================================================
// EngineState
// ============================================================================

/// Phase of the sync state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Idle,
    Gathering,
    Merging,
    Pushing,
    AwaitingServer,
    Applying,
    Committing,
    Failed,
}

impl EngineState {
    /// Returns the state name as a static string
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Idle => "Idle",
            EngineState::Gathering => "Gathering",
            EngineState::Merging => "Merging",
            EngineState::Pushing => "Pushing",
            EngineState::AwaitingServer => "AwaitingServer",
            EngineState::Applying => "Applying",
            EngineState::Committing => "Committing",
            EngineState::Failed => "Failed",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// EngineContext
// ============================================================================

/// Tunables taken from the configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Root of this client's tree on the server
    pub relative_root_path: String,
    /// Account used for metadata queries
    pub user_id: String,
    /// Upper bound on every remote call
    pub network_timeout: Duration,
    /// Largest batch pushed in one cycle
    pub max_batch_size: usize,
    /// Retry delays for failed changes
    pub backoff: Backoff,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            relative_root_path: config.remote.relative_root_path.clone(),
            user_id: config.remote.user_id.clone(),
            network_timeout: config.sync.network_timeout(),
            max_batch_size: config.sync.max_batch_size.max(1),
            backoff: Backoff::from_config(&config.retry),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Every component handle the engine and its tasks work with
///
/// Built once at startup and shared by the worker, the watcher ingestor and
/// the notification listener.
#[derive(Clone)]
pub struct EngineContext {
    /// Identity used to recognize our own events
    pub client_id: ClientId,
    /// Durable local index
    pub index: Arc<dyn ILocalIndex>,
    /// Sync server
    pub remote: Arc<dyn IRemoteService>,
    /// Materializes server events on disk
    pub applier: Arc<dyn IFilesystemApplier>,
    /// Changes observed but not yet gathered
    pub queue: Arc<ChangeQueue>,
    /// Paths the engine is writing
    pub echo: Arc<EchoSuppressor>,
    pub settings: EngineSettings,
}

impl EngineContext {
    /// Builds the context, seeding the change queue from the index
    pub async fn new(
        client_id: ClientId,
        settings: EngineSettings,
        index: Arc<dyn ILocalIndex>,
        remote: Arc<dyn IRemoteService>,
        applier: Arc<dyn IFilesystemApplier>,
    ) -> anyhow::Result<Self> {
        let highest = index
            .max_change_id()
            .await
            .context("Failed to read highest change id from index")?;
        debug!(highest = ?highest, "Seeding change queue");

        Ok(Self {
            client_id,
            index,
            remote,
            applier,
            queue: Arc::new(ChangeQueue::new(highest)),
            echo: Arc::new(EchoSuppressor::default()),
            settings,
        })
    }
}

// ============================================================================
// CycleReport
// ============================================================================

/// Summary of one sync cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    /// False when another cycle was already running
    pub ran: bool,
    /// Shutdown interrupted a network wait
    pub cancelled: bool,
    /// Sync id committed by this cycle
    pub sync_id: Option<SyncId>,
    /// Index generation after the commit
    pub generation: Option<u64>,
    /// Local changes sent to the server
    pub pushed: u32,
    /// Local changes acknowledged and committed
    pub completed: u32,
    /// Server events materialized on disk
    pub applied: u32,
    /// Server events already applied on a previous run
    pub skipped_events: u32,
    /// Server events held back for a later cycle
    pub deferred: u32,
    /// Changes held back for a later cycle
    pub blocked: u32,
    /// Changes dropped as malformed or refused by the server
    pub rejected: u32,
    /// Changes refused by the index
    pub conflicts: u32,
    /// Changes removed by coalescing
    pub coalesced: u32,
    /// Changes carrying nothing new for the index
    pub unchanged: u32,
    /// The server has more to send
    pub more_pending: bool,
    /// Non-fatal errors (collected, not propagated)
    pub errors: CompositeError,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

// ============================================================================
// SyncEngine
// ============================================================================

/// The synchronization state machine
///
/// ## Dependencies
///
/// Everything is reached through the [`EngineContext`]. The engine owns the
/// failure set and the lifecycle of in-flight changes; persisted path state
/// belongs to the index.
pub struct SyncEngine {
    ctx: EngineContext,
    resolver: DependencyResolver,
    failures: Mutex<FailureSet>,
    cycle_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<EngineState>,
    halted: Mutex<Option<String>>,
    relocation: Mutex<Option<PathBuf>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);
        Self {
            ctx,
            resolver: DependencyResolver::new(),
            failures: Mutex::new(FailureSet::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            state_tx,
            halted: Mutex::new(None),
            relocation: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Current state machine phase
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Receives every state transition
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Engine state changed");
        }
    }

    /// Changes waiting for a retry, with the reason they failed
    pub fn failures(&self) -> Vec<(ChangeId, FailureReason)> {
        lock(&self.failures)
            .iter()
            .filter_map(|entry| Some((entry.change.id()?, entry.reason.clone())))
            .collect()
    }

    /// Reason the engine stopped, if a fatal error occurred
    pub fn halt_reason(&self) -> Option<String> {
        lock(&self.halted).clone()
    }

    /// Clears a halt once the index has been rebuilt
    pub fn resume(&self) {
        if lock(&self.halted).take().is_some() {
            info!("Sync engine resumed");
        }
    }

    /// Moves every record under `new_root` at the next commit
    pub fn request_relocation(&self, new_root: PathBuf) {
        info!(new_root = %new_root.display(), "Sync root relocation requested");
        *lock(&self.relocation) = Some(new_root);
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Re-resolves changes that were in flight when the process stopped
    ///
    /// The index still holds them as pending. Each one goes to the failure
    /// set with reason `Interrupted`, due immediately. When the server
    /// already holds identical content, its revision and storage key are
    /// adopted so the retry does not look divergent.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let pending = self
            .ctx
            .index
            .pending_records()
            .await
            .map_err(index_failure("recovery read"))?;

        if pending.is_empty() {
            debug!("No interrupted changes to recover");
            return Ok(0);
        }
        info!(count = pending.len(), "Recovering changes left in flight");

        let count = pending.len();
        for mut change in pending {
            if change.kind() != ChangeKind::Deleted {
                self.refresh_from_server(&mut change).await;
            }
            lock(&self.failures).insert(change, FailureReason::Interrupted, Utc::now(), |_| {
                Duration::ZERO
            });
        }
        Ok(count)
    }

    async fn refresh_from_server(&self, change: &mut FileChange) {
        let query = MetadataQuery {
            user_id: self.ctx.settings.user_id.clone(),
            path: change.path().clone(),
            is_folder: change.is_folder(),
        };
        let lookup =
            tokio::time::timeout(self.ctx.settings.network_timeout, self.ctx.remote.query_metadata(&query))
                .await;

        match lookup {
            Ok(Ok(Some(server))) if server.same_content(change.metadata()) => {
                debug!(change = %change, revision = server.revision, "Server already holds this content");
                let mut metadata = change.metadata().clone();
                metadata.revision = server.revision;
                metadata.storage_key = server.storage_key;
                change.set_metadata(metadata);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(change = %change, error = %e, "Metadata query failed during recovery"),
            Err(_) => debug!(change = %change, "Metadata query timed out during recovery"),
        }
    }

    // ========================================================================
    // Sync cycle
    // ========================================================================

    /// Runs one sync cycle
    ///
    /// Returns immediately with `ran == false` if a cycle is already running.
    /// Only fatal errors are returned; everything else is collected in the
    /// report.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::EngineHalted` once a fatal error has stopped the
    /// engine, and the fatal error itself on the cycle that hit it.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, SyncError> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("Sync cycle already running, coalescing trigger");
            return Ok(CycleReport::default());
        };
        if let Some(reason) = self.halt_reason() {
            return Err(SyncError::EngineHalted(reason));
        }

        let start = Instant::now();
        let mut report = CycleReport {
            ran: true,
            ..CycleReport::default()
        };

        let outcome = self.cycle(cancel, &mut report).await;
        report.duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.set_state(EngineState::Idle);
                info!(
                    sync_id = ?report.sync_id.as_ref().map(SyncId::as_str),
                    pushed = report.pushed,
                    completed = report.completed,
                    applied = report.applied,
                    deferred = report.deferred,
                    blocked = report.blocked,
                    conflicts = report.conflicts,
                    errors = report.errors.len(),
                    duration_ms = report.duration_ms,
                    "Sync cycle complete"
                );
                Ok(report)
            }
            Err(err) if err.is_fatal() => {
                self.set_state(EngineState::Failed);
                error!(error = %err, "Fatal error, halting sync engine");
                *lock(&self.halted) = Some(err.to_string());
                self.set_state(EngineState::Idle);
                Err(err)
            }
            Err(err) => {
                self.set_state(EngineState::Failed);
                warn!(error = %err, duration_ms = report.duration_ms, "Sync cycle failed");
                report.errors.push(err);
                self.set_state(EngineState::Idle);
                Ok(report)
            }
        }
    }

    async fn cycle(&self, cancel: &CancellationToken, report: &mut CycleReport) -> Result<(), SyncError> {
        self.set_state(EngineState::Gathering);
        let (ready, resolution) = self.gather(report);

        if ready.is_empty() {
            return self.pull_until_settled(cancel, report).await;
        }

        self.set_state(EngineState::Merging);
        let batch = self.merge(ready, &resolution, report).await?;
        if batch.is_empty() {
            return self.pull_until_settled(cancel, report).await;
        }

        self.set_state(EngineState::Pushing);
        let response = match self.push(&batch, cancel).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                info!(count = batch.len(), "Push cancelled by shutdown; changes stay pending");
                report.cancelled = true;
                return Ok(());
            }
            Err(err) => {
                self.fail_batch(batch, &err);
                return Err(err);
            }
        };
        report.pushed = batch.len() as u32;

        self.set_state(EngineState::Applying);
        let acknowledged = self.apply_events(&response.events, report).await?;
        let acked_batch = self.settle_batch(batch, &acknowledged, &response, report);

        self.set_state(EngineState::Committing);
        self.commit(&response.sync_id, &acknowledged, report).await?;
        for mut change in acked_batch {
            if let Err(e) = change.transition_to(ChangeState::Completed) {
                debug!(change = %change, error = %e, "Completed change was not in flight");
            }
            report.completed += 1;
        }

        report.more_pending = response.partial || response.pending_count.unwrap_or(0) > 0;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Gathering
    // ------------------------------------------------------------------------

    fn gather(&self, report: &mut CycleReport) -> (Vec<FileChange>, Resolution) {
        let mut resolution = {
            let mut failures = lock(&self.failures);
            let candidates = self.ctx.queue.drain(&mut failures, Utc::now());
            if candidates.is_empty() {
                return (Vec::new(), Resolution::default());
            }
            let resolution = self.resolver.resolve(candidates, &failures);
            for (change, _) in &resolution.rejected {
                if let Some(id) = change.id() {
                    failures.forget(id);
                }
            }
            resolution
        };

        report.coalesced += resolution.coalesced.len() as u32;
        for (change, reason) in &resolution.rejected {
            warn!(change = %change, reason = %reason, "Dropping rejected change");
            report.errors.push(SyncError::Validation(format!("{change}: {reason}")));
            report.rejected += 1;
        }

        let mut ready = std::mem::take(&mut resolution.ready);
        let mut requeue: Vec<FileChange> = Vec::new();
        if ready.len() > self.ctx.settings.max_batch_size {
            let overflow = ready.split_off(self.ctx.settings.max_batch_size);
            debug!(deferred = overflow.len(), "Batch size limit reached");
            requeue.extend(overflow);
        }
        for (change, reason) in std::mem::take(&mut resolution.blocked) {
            debug!(change = %change, reason = %reason, "Change blocked until next cycle");
            report.blocked += 1;
            requeue.push(change);
        }
        if !requeue.is_empty() {
            requeue.sort_by_key(FileChange::id);
            self.ctx.queue.enqueue(requeue, true);
        }

        (ready, resolution)
    }

    // ------------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------------

    async fn merge(
        &self,
        ready: Vec<FileChange>,
        resolution: &Resolution,
        report: &mut CycleReport,
    ) -> Result<Vec<FileChange>, SyncError> {
        let mut merged = Vec::with_capacity(ready.len());
        let mut held: HashSet<ChangeId> = HashSet::new();
        let mut requeue = Vec::new();

        for change in ready {
            let Some(id) = change.id() else { continue };

            if resolution.blockers_of(id).iter().any(|b| held.contains(b)) {
                debug!(change_id = %id, "Holding change behind a refused dependency");
                held.insert(id);
                report.blocked += 1;
                requeue.push(change);
                continue;
            }

            let outcome = self
                .ctx
                .index
                .merge_changes(std::slice::from_ref(&change))
                .await
                .map_err(index_failure("merge"))?;

            for conflict in outcome.conflicts {
                warn!(change = %conflict.change, reason = %conflict.reason, "Merge conflict");
                held.insert(id);
                report.conflicts += 1;
                report
                    .errors
                    .push(SyncError::Conflict(format!("{}: {}", conflict.change, conflict.reason)));
                self.record_failure(conflict.change, FailureReason::Conflict(conflict.reason));
            }
            for skipped in outcome.skipped {
                debug!(change = %skipped, "Change carries nothing new");
                report.unchanged += 1;
                lock(&self.failures).forget(id);
            }
            for mut accepted in outcome.merged {
                if accepted.state() != ChangeState::InFlight {
                    accepted.restore_state(ChangeState::InFlight);
                }
                merged.push(accepted);
            }
        }

        if !requeue.is_empty() {
            self.ctx.queue.enqueue(requeue, true);
        }
        debug!(merged = merged.len(), "Merged batch into index");
        Ok(merged)
    }

    // ------------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------------

    /// Awaits a remote call under the network timeout
    ///
    /// Returns `Ok(None)` if shutdown was requested first.
    async fn remote_call<T, F>(&self, cancel: &CancellationToken, call: F) -> Result<Option<T>, SyncError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let timeout = self.ctx.settings.network_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = tokio::time::timeout(timeout, call) => match result {
                Err(_) => Err(SyncError::Transient(format!(
                    "Remote call timed out after {}s",
                    timeout.as_secs_f32()
                ))),
                Ok(Err(err)) => Err(classify_remote_error(&err)),
                Ok(Ok(value)) => Ok(Some(value)),
            },
        }
    }

    async fn push(
        &self,
        batch: &[FileChange],
        cancel: &CancellationToken,
    ) -> Result<Option<PushResponse>, SyncError> {
        let cursor = self.ctx.index.cursor().await.map_err(index_failure("cursor read"))?;
        let request = PushRequest {
            relative_root_path: self.ctx.settings.relative_root_path.clone(),
            last_sync_id: cursor.last_sync_id,
            client_id: self.ctx.client_id,
            events: batch.iter().filter_map(WireChange::from_change).collect(),
        };

        info!(
            count = request.events.len(),
            last_sync_id = ?request.last_sync_id.as_ref().map(SyncId::as_str),
            "Pushing local changes"
        );
        self.remote_call(cancel, self.ctx.remote.push(&request)).await
    }

    /// Sync_From until the server has nothing more to send
    async fn pull_until_settled(
        &self,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        loop {
            self.set_state(EngineState::AwaitingServer);
            let cursor = self.ctx.index.cursor().await.map_err(index_failure("cursor read"))?;
            let request = PullRequest {
                relative_root_path: self.ctx.settings.relative_root_path.clone(),
                last_sync_id: cursor.last_sync_id,
            };

            let Some(response) = self.remote_call(cancel, self.ctx.remote.pull(&request)).await?
            else {
                info!("Pull cancelled by shutdown");
                report.cancelled = true;
                return Ok(());
            };
            debug!(
                sync_id = %response.sync_id,
                events = response.events.len(),
                partial = response.partial,
                "Pulled remote events"
            );

            self.set_state(EngineState::Applying);
            let acknowledged = self.apply_events(&response.events, report).await?;

            self.set_state(EngineState::Committing);
            self.commit(&response.sync_id, &acknowledged, report).await?;
            report.completed += acknowledged.len() as u32;

            if !response.partial {
                return Ok(());
            }
            debug!("Partial response, polling again");
        }
    }

    // ------------------------------------------------------------------------
    // Applying
    // ------------------------------------------------------------------------

    /// Applies server events; returns the local change ids they acknowledge
    ///
    /// Events deferred by earlier cycles are retried first, since they are
    /// older than anything in `events`.
    async fn apply_events(
        &self,
        events: &[ServerEvent],
        report: &mut CycleReport,
    ) -> Result<BTreeSet<ChangeId>, SyncError> {
        self.retry_deferred(report).await?;

        let index = &self.ctx.index;
        let mut acknowledged = BTreeSet::new();

        for event in events {
            let already_applied = index
                .is_event_applied(event.event_id)
                .await
                .map_err(index_failure("event lookup"))?;

            if let Some(change_id) = event.acknowledges(&self.ctx.client_id) {
                acknowledged.insert(change_id);
                if already_applied {
                    report.skipped_events += 1;
                    continue;
                }
                index
                    .apply_server_event(event, EventOrigin::Local(change_id))
                    .await
                    .map_err(index_failure("acknowledgement"))?;
                index
                    .mark_event_completed_on_previous_sync(event.event_id)
                    .await
                    .map_err(index_failure("event marker"))?;
                debug!(event_id = %event.event_id, change_id = %change_id, "Change acknowledged");
                continue;
            }

            if already_applied {
                debug!(event_id = %event.event_id, path = %event.path, "Event already applied");
                report.skipped_events += 1;
                continue;
            }

            self.apply_remote(event, false, report).await?;
        }

        Ok(acknowledged)
    }

    /// Retries deferred server events, oldest first
    async fn retry_deferred(&self, report: &mut CycleReport) -> Result<(), SyncError> {
        let index = &self.ctx.index;
        let held = index
            .deferred_events()
            .await
            .map_err(index_failure("deferred read"))?;

        for deferred in held {
            let event = &deferred.event;
            let record = index
                .get_record(&event.path)
                .await
                .map_err(index_failure("record lookup"))?;
            if record.and_then(|r| r.last_event_id).is_some_and(|last| last > event.event_id) {
                debug!(event_id = %event.event_id, path = %event.path, "Deferred event superseded");
                index
                    .mark_event_completed_on_previous_sync(event.event_id)
                    .await
                    .map_err(index_failure("event marker"))?;
                continue;
            }

            debug!(
                event_id = %event.event_id,
                path = %event.path,
                attempts = deferred.attempts,
                reason = %deferred.reason,
                "Retrying deferred server event"
            );
            self.apply_remote(event, true, report).await?;
        }
        Ok(())
    }

    /// Applies a foreign event to the index, then to the filesystem
    ///
    /// The event is deferred instead when a local change on one of its paths
    /// is still waiting for the server, or when the filesystem refuses it.
    async fn apply_remote(
        &self,
        event: &ServerEvent,
        retrying: bool,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let index = &self.ctx.index;

        if let Some(change_id) = self.pending_local_change(event).await? {
            if retrying {
                debug!(event_id = %event.event_id, change_id = %change_id, "Deferred event still waits on a local change");
                return Ok(());
            }
            let reason = format!("local change {change_id} on {} is not confirmed yet", event.path);
            warn!(
                event_id = %event.event_id,
                path = %event.path,
                change_id = %change_id,
                "Server event conflicts with a pending local change"
            );
            index
                .defer_event(event, &reason)
                .await
                .map_err(index_failure("event deferral"))?;
            report.conflicts += 1;
            report.deferred += 1;
            report
                .errors
                .push(SyncError::Conflict(format!("{} {}: {reason}", event.kind, event.path)));
            return Ok(());
        }

        index
            .apply_server_event(event, EventOrigin::Remote)
            .await
            .map_err(index_failure("remote event"))?;
        self.ctx.echo.register(&event.path);
        if let Some(from) = &event.from_path {
            self.ctx.echo.register(from);
        }

        match self.ctx.applier.apply(event).await {
            Ok(()) => {
                index
                    .mark_event_completed_on_previous_sync(event.event_id)
                    .await
                    .map_err(index_failure("event marker"))?;
                report.applied += 1;
            }
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    path = %event.path,
                    error = %err,
                    "Failed to apply server event, deferring"
                );
                index
                    .defer_event(event, &format!("{err:#}"))
                    .await
                    .map_err(index_failure("event deferral"))?;
                report.deferred += 1;
                report.errors.push(SyncError::Transient(format!(
                    "Applying {} {} failed: {err:#}",
                    event.kind, event.path
                )));
            }
        }
        Ok(())
    }

    /// A local change not yet confirmed by the server on a path `event` touches
    async fn pending_local_change(&self, event: &ServerEvent) -> Result<Option<ChangeId>, SyncError> {
        let index = &self.ctx.index;
        let removes_subtree = matches!(event.kind, ChangeKind::Deleted | ChangeKind::Renamed);

        for path in std::iter::once(&event.path).chain(event.from_path.iter()) {
            let record = index
                .get_record(path)
                .await
                .map_err(index_failure("record lookup"))?;
            if let Some(id) = record.and_then(|r| r.pending_change_id) {
                return Ok(Some(id));
            }
            if removes_subtree {
                let nested = index
                    .records_under(path)
                    .await
                    .map_err(index_failure("subtree lookup"))?;
                if let Some(id) = nested.iter().find_map(|r| r.pending_change_id) {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Sorts a pushed batch into acknowledged, rejected and unanswered
    fn settle_batch(
        &self,
        batch: Vec<FileChange>,
        acknowledged: &BTreeSet<ChangeId>,
        response: &PushResponse,
        report: &mut CycleReport,
    ) -> Vec<FileChange> {
        let rejected: HashMap<ChangeId, &str> = response
            .rejected
            .iter()
            .map(|r| (r.change_id, r.reason.as_str()))
            .collect();

        let mut acked = Vec::new();
        for change in batch {
            let Some(id) = change.id() else { continue };
            if acknowledged.contains(&id) {
                acked.push(change);
            } else if let Some(reason) = rejected.get(&id) {
                warn!(change = %change, reason = %reason, "Server rejected change");
                report.rejected += 1;
                report
                    .errors
                    .push(SyncError::Conflict(format!("{change}: rejected by server: {reason}")));
                self.record_failure(change, FailureReason::Rejected((*reason).to_string()));
            } else {
                debug!(change = %change, "Change not acknowledged, will retry");
                self.record_failure(
                    change,
                    FailureReason::Transient("not acknowledged by server".into()),
                );
            }
        }
        acked
    }

    // ------------------------------------------------------------------------
    // Committing
    // ------------------------------------------------------------------------

    async fn commit(
        &self,
        sync_id: &SyncId,
        acknowledged: &BTreeSet<ChangeId>,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let new_root = lock(&self.relocation).clone();
        let completed: Vec<ChangeId> = acknowledged.iter().copied().collect();

        let generation = self
            .ctx
            .index
            .complete_sync(sync_id, &completed, new_root.as_deref())
            .await
            .map_err(index_failure("commit"))?;

        if let Some(root) = new_root {
            self.finish_relocation(&root);
        }
        {
            let mut failures = lock(&self.failures);
            for id in &completed {
                failures.forget(*id);
            }
        }

        debug!(sync_id = %sync_id, generation, completed = completed.len(), "Committed sync point");
        report.sync_id = Some(sync_id.clone());
        report.generation = Some(generation);
        Ok(())
    }

    fn finish_relocation(&self, committed: &Path) {
        let mut pending = lock(&self.relocation);
        if pending.as_deref() == Some(committed) {
            *pending = None;
            info!(root = %committed.display(), "Sync root relocated");
        }
    }

    // ------------------------------------------------------------------------
    // Failure bookkeeping
    // ------------------------------------------------------------------------

    fn record_failure(&self, change: FileChange, reason: FailureReason) {
        let backoff = self.ctx.settings.backoff;
        let shown = change.to_string();
        let code = reason.code();
        let attempt = lock(&self.failures).insert(change, reason, Utc::now(), |n| backoff.delay(n));
        debug!(change = %shown, reason = code, attempt = ?attempt, "Change scheduled for retry");
    }

    fn fail_batch(&self, batch: Vec<FileChange>, err: &SyncError) {
        warn!(count = batch.len(), error = %err, "Push failed, batch returned to failure set");
        for change in batch {
            let reason = if err.is_transient() {
                FailureReason::Transient(err.to_string())
            } else {
                FailureReason::Rejected(err.to_string())
            };
            self.record_failure(change, reason);
        }
    }
}
