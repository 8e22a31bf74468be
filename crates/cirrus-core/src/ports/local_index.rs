//! Local index port (driven/secondary port)
//!
//! This module defines the interface for the durable local index: the
//! per-path record table, its revision history and the sync cursor.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//!   Conflicts are not errors: they are returned in [`MergeOutcome`].
//! - Every mutation is transactional at single-change granularity. Two
//!   mutations on the same path never interleave; lookups take a shared
//!   per-path lock.

use std::path::Path;

use crate::domain::{
    newtypes::{ChangeId, EventId, RelativePath, SyncId},
    FileChange, FileMetadata, IndexRecord, ServerEvent, SyncCursor,
};

/// A change the index refused to merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    /// The refused change
    pub change: FileChange,
    /// Human-readable explanation
    pub reason: String,
}

/// Result of merging a batch of changes into the index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Changes applied to the index, now in flight
    pub merged: Vec<FileChange>,
    /// Changes refused because they conflict with index state
    pub conflicts: Vec<MergeConflict>,
    /// Changes that carry nothing new (self-echoes)
    pub skipped: Vec<FileChange>,
}

impl MergeOutcome {
    /// Ids of the merged changes in batch order
    pub fn merged_ids(&self) -> Vec<ChangeId> {
        self.merged.iter().filter_map(FileChange::id).collect()
    }
}

/// A server event waiting for its effect to be retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEvent {
    /// The event as the server sent it
    pub event: ServerEvent,
    /// Why it was held back the last time
    pub reason: String,
    /// Number of times it was deferred
    pub attempts: u32,
}

/// Where a server event came from, as seen by the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Acknowledges a change this client pushed
    Local(ChangeId),
    /// Originated on another client
    Remote,
}

/// Port trait for the durable local index
#[async_trait::async_trait]
pub trait ILocalIndex: Send + Sync {
    // --- Mutations ---

    /// Merges a resolved batch, one transaction per change
    ///
    /// Merged changes get `pending_change_id` set on their records and their
    /// ids added to the cursor's pending set. Re-merging a change that is
    /// already pending under the same id is accepted unless the record has
    /// since diverged from the change's base revision.
    async fn merge_changes(&self, batch: &[FileChange]) -> anyhow::Result<MergeOutcome>;

    /// Commits a sync point
    ///
    /// Advances the cursor to `sync_id`, clears the pending markers of
    /// `completed`, purges committed tombstones and, when `new_root` is
    /// given, rewrites every record's local path under it. Returns the new
    /// generation. Repeating an identical call returns the same generation
    /// without changing anything.
    async fn complete_sync(
        &self,
        sync_id: &SyncId,
        completed: &[ChangeId],
        new_root: Option<&Path>,
    ) -> anyhow::Result<u64>;

    /// Records that a server event's filesystem effect has landed
    ///
    /// Also clears the event from the deferred set.
    async fn mark_event_completed_on_previous_sync(&self, event_id: EventId)
        -> anyhow::Result<()>;

    /// Holds a server event for a later retry
    ///
    /// Deferring an event that is already held bumps its attempt count.
    /// Applying a newer event of either origin on the same path drops the
    /// held one, as does a newer delete or rename of one of its ancestors.
    async fn defer_event(&self, event: &ServerEvent, reason: &str) -> anyhow::Result<()>;

    /// Updates the index for a server event before it touches the filesystem
    ///
    /// For [`EventOrigin::Local`] only the server-assigned metadata of the
    /// acknowledged record is rewritten; pending markers are left for
    /// [`complete_sync`](Self::complete_sync).
    async fn apply_server_event(
        &self,
        event: &ServerEvent,
        origin: EventOrigin,
    ) -> anyhow::Result<()>;

    // --- Queries ---

    /// Returns true if the event was marked completed
    async fn is_event_applied(&self, event_id: EventId) -> anyhow::Result<bool>;

    /// Historical metadata of `path` at `revision`
    async fn lookup_metadata(
        &self,
        path: &RelativePath,
        revision: u64,
    ) -> anyhow::Result<Option<FileMetadata>>;

    /// Current record for a path, tombstones included
    async fn get_record(&self, path: &RelativePath) -> anyhow::Result<Option<IndexRecord>>;

    /// Live records strictly below `path`
    async fn records_under(&self, path: &RelativePath) -> anyhow::Result<Vec<IndexRecord>>;

    /// The persisted sync cursor
    async fn cursor(&self) -> anyhow::Result<SyncCursor>;

    /// Changes merged but not yet committed, rebuilt from the pending log
    async fn pending_records(&self) -> anyhow::Result<Vec<FileChange>>;

    /// Held server events, oldest event first
    async fn deferred_events(&self) -> anyhow::Result<Vec<DeferredEvent>>;

    /// Highest change id ever merged
    async fn max_change_id(&self) -> anyhow::Result<Option<ChangeId>>;
}
