//! File watching and change ingestion
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate and converts raw
//! OS events into [`WatchEvent`] values, and a [`ChangeIngestor`] that turns
//! those into [`FileChange`]s on the change queue.
//!
//! ## Architecture
//!
//! ```text
//! inotify / FSEvents
//!       │
//!       ▼
//!  FileWatcher ──→ mpsc::channel ──→ ChangeIngestor ──→ ChangeQueue
//!                                         │
//!                                         └──→ SyncTrigger
//! ```
//!
//! The ingestor stats and hashes each path when its event arrives, so the
//! queued change describes what is on disk, not what the OS reported.
//! Events may be dropped or duplicated by the OS; the resolver's coalescing
//! absorbs duplicates and the next event on a path corrects a missed one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cirrus_core::domain::{ChangeId, ChangeKind, FileChange, FileMetadata, RelativePath};
use cirrus_core::ports::ILocalIndex;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::applier::TEMP_SUFFIX;
use crate::echo::EchoSuppressor;
use crate::engine::EngineContext;
use crate::hashing::hash_file;
use crate::queue::ChangeQueue;
use crate::worker::SyncTrigger;

/// How long the first half of a move waits for its second half
const MOVE_PAIR_WINDOW: Duration = Duration::from_millis(100);

/// How long a created path that the index has not seen yet is remembered
const UNINDEXED_TTL: Duration = Duration::from_secs(600);

// ============================================================================
// WatchEvent
// ============================================================================

/// A filesystem change as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file or directory appeared
    Created(PathBuf),
    /// Content or metadata changed; also used when the OS cannot tell
    Modified(PathBuf),
    /// A file or directory disappeared
    Deleted(PathBuf),
    /// First half of a move reported in two parts
    MovedFrom(PathBuf),
    /// Second half of a move reported in two parts
    MovedTo(PathBuf),
    /// A move reported with both paths
    Renamed {
        /// The original path before the rename
        old: PathBuf,
        /// The new path after the rename
        new: PathBuf,
    },
}

impl WatchEvent {
    /// Returns the primary path associated with this event
    ///
    /// For rename events, this returns the new (destination) path.
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(p)
            | WatchEvent::Modified(p)
            | WatchEvent::Deleted(p)
            | WatchEvent::MovedFrom(p)
            | WatchEvent::MovedTo(p) => p,
            WatchEvent::Renamed { new, .. } => new,
        }
    }
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the sync root using the OS-native mechanism
///
/// ## Usage
///
/// ```ignore
/// let (mut watcher, rx) = FileWatcher::new()?;
/// let handle = watcher.watch(&root)?;
/// // rx.recv().await to get events
/// ```
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates a watcher and the receiver its events are delivered on
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(1024);

        info!("Initializing file watcher");

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = event_tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send watch event (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, event_rx))
    }

    /// Starts watching a directory recursively
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (missing, permissions,
    /// or the inotify watch limit)
    pub fn watch(&mut self, path: &Path) -> Result<WatchHandle> {
        info!(path = %path.display(), "Starting recursive watch");

        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))?;

        Ok(WatchHandle {
            path: path.to_path_buf(),
        })
    }

    /// Stops watching a directory
    pub fn unwatch(&mut self, handle: WatchHandle) -> Result<()> {
        info!(path = %handle.path.display(), "Stopping watch");

        self.watcher
            .unwatch(&handle.path)
            .with_context(|| format!("Failed to unwatch path: {}", handle.path.display()))
    }
}

/// An active recursive watch
#[derive(Debug)]
pub struct WatchHandle {
    path: PathBuf,
}

impl WatchHandle {
    /// Returns the watched path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Converts a `notify::Event` into a [`WatchEvent`]
///
/// - `Create(*)` -> `Created`
/// - `Remove(*)` -> `Deleted`
/// - `Modify(Name(From))` / `Modify(Name(To))` -> `MovedFrom` / `MovedTo`
/// - `Modify(Name(Both))` with 2 paths -> `Renamed`
/// - other `Modify(*)` -> `Modified`
///
/// Access events are ignored.
fn map_notify_event(event: &notify::Event) -> Option<WatchEvent> {
    let paths = &event.paths;

    let mapped = match &event.kind {
        EventKind::Create(_) => WatchEvent::Created(paths.first()?.clone()),
        EventKind::Remove(_) => WatchEvent::Deleted(paths.first()?.clone()),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            WatchEvent::MovedFrom(paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            WatchEvent::MovedTo(paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            WatchEvent::Renamed {
                old: paths[0].clone(),
                new: paths[1].clone(),
            }
        }
        EventKind::Modify(_) => WatchEvent::Modified(paths.first()?.clone()),
        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };

    debug!(event = ?mapped, "Mapped notify event");
    Some(mapped)
}

// ============================================================================
// Move pairing
// ============================================================================

/// Joins moves reported as separate `MovedFrom` / `MovedTo` halves
///
/// Some backends report a move three times: both halves, then once more
/// with both paths. The pair is emitted once. A `MovedFrom` with no second
/// half within [`MOVE_PAIR_WINDOW`] left the tree and becomes `Deleted`; a
/// lone `MovedTo` came from outside and becomes `Created`.
#[derive(Debug, Default)]
struct MoveTracker {
    source: Option<(PathBuf, Instant)>,
    last_pair: Option<(PathBuf, PathBuf)>,
}

impl MoveTracker {
    fn pair(&mut self, event: WatchEvent, now: Instant) -> Vec<WatchEvent> {
        match event {
            WatchEvent::MovedFrom(path) => {
                let out = self.flush();
                self.source = Some((path, now + MOVE_PAIR_WINDOW));
                out
            }
            WatchEvent::MovedTo(path) => match self.source.take() {
                Some((old, _)) => {
                    self.last_pair = Some((old.clone(), path.clone()));
                    vec![WatchEvent::Renamed { old, new: path }]
                }
                None => vec![WatchEvent::Created(path)],
            },
            WatchEvent::Renamed { old, new } => {
                let mut out = self.flush();
                let repeated = self
                    .last_pair
                    .take()
                    .is_some_and(|(o, n)| o == old && n == new);
                if !repeated {
                    out.push(WatchEvent::Renamed { old, new });
                }
                out
            }
            other => {
                let mut out = self.flush();
                self.last_pair = None;
                out.push(other);
                out
            }
        }
    }

    /// When the pending `MovedFrom` gives up waiting
    fn deadline(&self) -> Option<Instant> {
        self.source.as_ref().map(|(_, deadline)| *deadline)
    }

    fn flush(&mut self) -> Vec<WatchEvent> {
        self.source
            .take()
            .map(|(path, _)| vec![WatchEvent::Deleted(path)])
            .unwrap_or_default()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// ChangeIngestor
// ============================================================================

/// What the client already knows about a path
enum Known {
    /// Live index record
    Indexed(FileMetadata),
    /// Created locally, not merged yet
    Queued(FileMetadata),
}

impl Known {
    fn metadata(&self) -> &FileMetadata {
        match self {
            Known::Indexed(m) | Known::Queued(m) => m,
        }
    }
}

/// Converts watch events into queued changes
///
/// Runs on its own task and only appends to the change queue; every batch
/// it enqueues is followed by a sync request.
pub struct ChangeIngestor {
    root: PathBuf,
    index: Arc<dyn ILocalIndex>,
    queue: Arc<ChangeQueue>,
    echo: Arc<EchoSuppressor>,
    trigger: SyncTrigger,
    unindexed: HashMap<RelativePath, (FileMetadata, Instant)>,
}

impl ChangeIngestor {
    pub fn new(ctx: &EngineContext, root: PathBuf, trigger: SyncTrigger) -> Self {
        Self {
            root,
            index: ctx.index.clone(),
            queue: ctx.queue.clone(),
            echo: ctx.echo.clone(),
            trigger,
            unindexed: HashMap::new(),
        }
    }

    /// Consumes events until the channel closes or `cancel` fires
    pub async fn run(mut self, mut events: mpsc::Receiver<WatchEvent>, cancel: CancellationToken) {
        info!(root = %self.root.display(), "Change ingestor starting");
        let mut moves = MoveTracker::default();

        loop {
            let pending = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(moves.deadline()) => moves.flush(),
                event = events.recv() => match event {
                    Some(event) => moves.pair(event, Instant::now()),
                    None => {
                        info!("Watch channel closed");
                        let rest = moves.flush();
                        self.ingest_all(rest).await;
                        break;
                    }
                },
            };
            self.ingest_all(pending).await;
        }

        info!("Change ingestor stopped");
    }

    async fn ingest_all(&mut self, events: Vec<WatchEvent>) {
        for event in events {
            if let Err(e) = self.ingest(event.clone()).await {
                warn!(event = ?event, error = %e, "Failed to ingest watch event");
            }
        }
    }

    /// Turns one event into queued changes and requests a sync
    ///
    /// Returns the ids of the enqueued changes; empty if the event was an
    /// echo, outside the root, or changed nothing.
    pub async fn ingest(&mut self, event: WatchEvent) -> Result<Vec<ChangeId>> {
        let changes: Vec<FileChange> = match event {
            WatchEvent::Created(path)
            | WatchEvent::Modified(path)
            | WatchEvent::MovedTo(path) => self.observe(&path).await?.into_iter().collect(),
            WatchEvent::Deleted(path) | WatchEvent::MovedFrom(path) => {
                self.removed(&path).await?.into_iter().collect()
            }
            WatchEvent::Renamed { old, new } => self.moved(&old, &new).await?,
        };

        if changes.is_empty() {
            return Ok(Vec::new());
        }
        for change in &changes {
            debug!(kind = %change.kind(), path = %change.path(), "Local change observed");
        }
        let ids = self.queue.enqueue(changes, false);
        self.trigger.request();
        Ok(ids)
    }

    /// Maps a local path to a syncable relative path
    fn relative(&self, local: &Path) -> Option<RelativePath> {
        if local
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
        {
            return None;
        }
        let rel = RelativePath::from_local(&self.root, local).ok()?;
        if rel.is_root() || self.echo.should_suppress(&rel) {
            return None;
        }
        Some(rel)
    }

    async fn known(&mut self, rel: &RelativePath) -> Result<Option<Known>> {
        if let Some(record) = self.index.get_record(rel).await?.filter(|r| r.is_live()) {
            self.unindexed.remove(rel);
            return Ok(Some(Known::Indexed(record.metadata)));
        }
        Ok(self
            .unindexed
            .get(rel)
            .map(|(metadata, _)| Known::Queued(metadata.clone())))
    }

    fn remember(&mut self, rel: RelativePath, metadata: FileMetadata) {
        let now = Instant::now();
        self.unindexed
            .retain(|_, (_, seen)| now.duration_since(*seen) < UNINDEXED_TTL);
        self.unindexed.insert(rel, (metadata, now));
    }

    /// A path that may have appeared or changed
    async fn observe(&mut self, local: &Path) -> Result<Option<FileChange>> {
        let Some(rel) = self.relative(local) else {
            return Ok(None);
        };
        let known = self.known(&rel).await?;

        let Some(metadata) = describe(local).await? else {
            // Gone again before we looked
            return Ok(self.forget(rel, known));
        };

        match known {
            Some(known) if known.metadata().same_content(&metadata) => {
                debug!(path = %rel, "No content change");
                Ok(None)
            }
            Some(Known::Indexed(base)) => {
                let metadata = based_on(metadata, &base);
                Ok(Some(FileChange::new(ChangeKind::Modified, rel, metadata)))
            }
            Some(Known::Queued(_)) => {
                self.remember(rel.clone(), metadata.clone());
                Ok(Some(FileChange::new(ChangeKind::Modified, rel, metadata)))
            }
            None => {
                self.remember(rel.clone(), metadata.clone());
                Ok(Some(FileChange::new(ChangeKind::Created, rel, metadata)))
            }
        }
    }

    /// A path that disappeared
    async fn removed(&mut self, local: &Path) -> Result<Option<FileChange>> {
        let Some(rel) = self.relative(local) else {
            return Ok(None);
        };
        let known = self.known(&rel).await?;
        Ok(self.forget(rel, known))
    }

    fn forget(&mut self, rel: RelativePath, known: Option<Known>) -> Option<FileChange> {
        self.unindexed.remove(&rel);
        match known {
            Some(known) => Some(FileChange::new(
                ChangeKind::Deleted,
                rel,
                known.metadata().clone(),
            )),
            None => {
                debug!(path = %rel, "Deleted path was never synced");
                None
            }
        }
    }

    async fn moved(&mut self, old: &Path, new: &Path) -> Result<Vec<FileChange>> {
        let (Some(from), Some(to)) = (self.relative(old), self.relative(new)) else {
            // One side is outside the tree or an echo
            let mut changes: Vec<FileChange> = self.removed(old).await?.into_iter().collect();
            changes.extend(self.observe(new).await?);
            return Ok(changes);
        };

        let Some(known) = self.known(&from).await? else {
            return Ok(self.observe(new).await?.into_iter().collect());
        };
        let Some(metadata) = describe(new).await? else {
            return Ok(self.forget(from, Some(known)).into_iter().collect());
        };

        if let Known::Queued(_) = known {
            self.unindexed.remove(&from);
            self.remember(to.clone(), metadata.clone());
        }
        let metadata = based_on(metadata, known.metadata());
        Ok(vec![FileChange::renamed(from, to, metadata)])
    }
}

/// Stats and hashes a local path; `None` if it does not exist
async fn describe(local: &Path) -> Result<Option<FileMetadata>> {
    let stat = match tokio::fs::metadata(local).await {
        Ok(stat) => stat,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", local.display()));
        }
    };
    let modified = stat
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    if stat.is_dir() {
        return Ok(Some(FileMetadata::folder(modified)));
    }
    let hash = hash_file(local).await?;
    Ok(Some(FileMetadata::file(hash, stat.len(), modified)))
}

/// Carries the server revision and storage key of what the change replaces
fn based_on(mut metadata: FileMetadata, base: &FileMetadata) -> FileMetadata {
    metadata.revision = base.revision;
    metadata.storage_key = base.storage_key.clone();
    metadata
}

// ============================================================================
// Unit tests
// ============================================================================
