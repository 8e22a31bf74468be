//! SQLite implementation of ILocalIndex
//!
//! This module provides the concrete SQLite-based implementation of the
//! local index port defined in cirrus-core. It handles domain type
//! serialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type        | SQL Type | Strategy                                  |
//! |--------------------|----------|-------------------------------------------|
//! | RelativePath       | TEXT     | `.as_str()` / `RelativePath::new()`        |
//! | ChangeId, EventId  | INTEGER  | cast through `i64`                         |
//! | SyncId             | TEXT     | `.as_str()` / `SyncId::new()`              |
//! | FileMetadata       | TEXT     | serde_json serialization                  |
//! | ChangeKind         | TEXT     | `Display` / `FromStr`                      |
//! | DateTime<Utc>      | TEXT     | ISO 8601 via `to_rfc3339()`                |
//!
//! ## Concurrency
//!
//! A single writer mutex serializes mutations. Each mutation also holds the
//! write half of a per-path lock for every path it touches, and lookups take
//! the read half, so a lookup never observes a path mid-mutation. Every
//! mutation of one change runs in its own SQLite transaction.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::{Mutex, RwLock};

use cirrus_core::domain::{
    newtypes::{ChangeId, EventId, RelativePath, SyncId},
    ChangeKind, ChangeState, FileChange, FileMetadata, IndexRecord, ServerEvent, SyncCursor,
};
use cirrus_core::ports::{DeferredEvent, EventOrigin, ILocalIndex, MergeConflict, MergeOutcome};

use crate::IndexError;

/// SQLite-based implementation of the local index port
pub struct SqliteLocalIndex {
    pool: SqlitePool,
    root: RwLock<PathBuf>,
    writer: Mutex<()>,
    path_locks: DashMap<RelativePath, Arc<RwLock<()>>>,
}

impl SqliteLocalIndex {
    /// Creates a new index over the given pool, rooted at `root`
    pub fn new(pool: SqlitePool, root: PathBuf) -> Self {
        Self {
            pool,
            root: RwLock::new(root),
            writer: Mutex::new(()),
            path_locks: DashMap::new(),
        }
    }

    /// Current local root used for `local_path`
    pub async fn root(&self) -> PathBuf {
        self.root.read().await.clone()
    }

    fn path_lock(&self, path: &RelativePath) -> Arc<RwLock<()>> {
        self.path_locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Locks for every path a change touches, in a stable order
    fn locks_for<'a>(&self, paths: impl Iterator<Item = &'a RelativePath>) -> Vec<Arc<RwLock<()>>> {
        let unique: BTreeSet<&RelativePath> = paths.collect();
        unique.into_iter().map(|p| self.path_lock(p)).collect()
    }

    /// Merges one change inside its own transaction
    async fn merge_one(&self, change: &FileChange, root: &Path) -> Result<MergeDecision, IndexError> {
        let Some(id) = change.id() else {
            return Ok(MergeDecision::Conflict("change has no id".to_string()));
        };

        let mut tx = self.pool.begin().await?;

        if pending_event_exists(&mut tx, id).await? {
            if let Some(reason) = remerge_divergence(&mut tx, id, change).await? {
                return Ok(MergeDecision::Conflict(reason));
            }
            tracing::debug!(change_id = %id, "Change already merged, accepting again");
            return Ok(MergeDecision::Merged);
        }

        let decision = match change.kind() {
            ChangeKind::Created | ChangeKind::Modified => {
                merge_upsert(&mut tx, id, change, root).await?
            }
            ChangeKind::Deleted => merge_delete(&mut tx, id, change).await?,
            ChangeKind::Renamed => merge_rename(&mut tx, id, change, root).await?,
        };

        if matches!(decision, MergeDecision::Merged) {
            insert_pending_event(&mut tx, id, change).await?;
            sqlx::query("UPDATE sync_cursor SET max_change_id = MAX(max_change_id, ?) WHERE id = 1")
                .bind(id.as_u64() as i64)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }

        Ok(decision)
    }

    async fn read_cursor(&self) -> Result<SyncCursor, IndexError> {
        let row = sqlx::query("SELECT * FROM sync_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| IndexError::Corrupted("sync cursor row is missing".to_string()))?;

        let last_sync_id: Option<String> = row.get("last_sync_id");
        let last_sync_id = match last_sync_id {
            Some(s) if !s.is_empty() => Some(SyncId::new(s).map_err(|e| {
                IndexError::SerializationError(format!("Invalid stored sync id: {e}"))
            })?),
            _ => None,
        };
        let generation: i64 = row.get("generation");
        let root_path: String = row.get("root_path");

        let ids: Vec<i64> = sqlx::query_scalar("SELECT change_id FROM pending_events ORDER BY change_id")
            .fetch_all(&self.pool)
            .await?;

        Ok(SyncCursor {
            last_sync_id,
            pending_event_ids: ids.into_iter().map(|i| ChangeId::new(i as u64)).collect(),
            generation: generation as u64,
            root_path: PathBuf::from(root_path),
        })
    }
}

/// Per-change merge verdict
#[derive(Debug)]
enum MergeDecision {
    Merged,
    Conflict(String),
    Skipped,
}

// ============================================================================
// Row mapping
// ============================================================================

fn record_from_row(row: &SqliteRow) -> Result<IndexRecord, IndexError> {
    let relative_path: String = row.get("relative_path");
    let local_path: String = row.get("local_path");
    let metadata: String = row.get("metadata");
    let last_event_id: Option<i64> = row.get("last_event_id");
    let pending_change_id: Option<i64> = row.get("pending_change_id");
    let deleted: i64 = row.get("deleted");

    let relative_path = RelativePath::new(&relative_path).map_err(|e| {
        IndexError::SerializationError(format!("Invalid stored path '{relative_path}': {e}"))
    })?;
    let metadata: FileMetadata = serde_json::from_str(&metadata)?;

    Ok(IndexRecord {
        relative_path,
        local_path: PathBuf::from(local_path),
        metadata,
        last_event_id: last_event_id.map(EventId::new),
        pending_change_id: pending_change_id.map(|i| ChangeId::new(i as u64)),
        deleted: deleted != 0,
    })
}

fn pending_change_from_row(row: &SqliteRow) -> Result<FileChange, IndexError> {
    let change_id: i64 = row.get("change_id");
    let kind: String = row.get("kind");
    let path: String = row.get("path");
    let from_path: Option<String> = row.get("from_path");
    let metadata: String = row.get("metadata");

    let kind: ChangeKind = kind
        .parse()
        .map_err(|e| IndexError::SerializationError(format!("{e}")))?;
    let path = RelativePath::new(&path)
        .map_err(|e| IndexError::SerializationError(format!("Invalid stored path: {e}")))?;
    let metadata: FileMetadata = serde_json::from_str(&metadata)?;

    let mut change = match (kind, from_path) {
        (ChangeKind::Renamed, Some(from)) => {
            let from = RelativePath::new(&from).map_err(|e| {
                IndexError::SerializationError(format!("Invalid stored path: {e}"))
            })?;
            FileChange::renamed(from, path, metadata)
        }
        (ChangeKind::Renamed, None) => {
            return Err(IndexError::Corrupted(format!(
                "pending rename {change_id} has no source path"
            )))
        }
        (kind, _) => FileChange::new(kind, path, metadata),
    }
    .with_id(ChangeId::new(change_id as u64));
    change.restore_state(ChangeState::InFlight);
    Ok(change)
}

/// `substr` prefix arguments selecting rows strictly below `path`
fn subtree_prefix(path: &RelativePath) -> (String, i64) {
    let prefix = if path.is_root() {
        "/".to_string()
    } else {
        format!("{}/", path.as_str())
    };
    let len = prefix.chars().count() as i64;
    (prefix, len)
}

// ============================================================================
// Transaction helpers
// ============================================================================

async fn fetch_record(
    conn: &mut SqliteConnection,
    path: &RelativePath,
) -> Result<Option<IndexRecord>, IndexError> {
    let row = sqlx::query("SELECT * FROM records WHERE relative_path = ?")
        .bind(path.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

async fn fetch_subtree(
    conn: &mut SqliteConnection,
    path: &RelativePath,
) -> Result<Vec<IndexRecord>, IndexError> {
    let (prefix, len) = subtree_prefix(path);
    let rows = sqlx::query(
        "SELECT * FROM records WHERE substr(relative_path, 1, ?) = ? AND relative_path != '/' \
         ORDER BY relative_path",
    )
    .bind(len)
    .bind(&prefix)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(record_from_row).collect()
}

async fn write_record(conn: &mut SqliteConnection, record: &IndexRecord) -> Result<(), IndexError> {
    let metadata = serde_json::to_string(&record.metadata)?;
    sqlx::query(
        "INSERT OR REPLACE INTO records \
         (relative_path, local_path, is_folder, revision, metadata, last_event_id, \
          pending_change_id, deleted, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.relative_path.as_str())
    .bind(record.local_path.to_string_lossy().into_owned())
    .bind(record.metadata.is_folder)
    .bind(record.metadata.revision as i64)
    .bind(&metadata)
    .bind(record.last_event_id.map(|e| e.as_i64()))
    .bind(record.pending_change_id.map(|c| c.as_u64() as i64))
    .bind(record.deleted)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_record(conn: &mut SqliteConnection, path: &RelativePath) -> Result<(), IndexError> {
    sqlx::query("DELETE FROM records WHERE relative_path = ?")
        .bind(path.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn record_history(
    conn: &mut SqliteConnection,
    path: &RelativePath,
    metadata: &FileMetadata,
) -> Result<(), IndexError> {
    if metadata.revision == 0 {
        return Ok(());
    }
    sqlx::query(
        "INSERT OR REPLACE INTO record_history (relative_path, revision, metadata, recorded_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(path.as_str())
    .bind(metadata.revision as i64)
    .bind(serde_json::to_string(metadata)?)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn pending_event_exists(conn: &mut SqliteConnection, id: ChangeId) -> Result<bool, IndexError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT change_id FROM pending_events WHERE change_id = ?")
        .bind(id.as_u64() as i64)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn insert_pending_event(
    conn: &mut SqliteConnection,
    id: ChangeId,
    change: &FileChange,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO pending_events (change_id, kind, path, from_path, metadata, merged_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id.as_u64() as i64)
    .bind(change.kind().to_string())
    .bind(change.path().as_str())
    .bind(change.from_path().map(|p| p.as_str().to_string()))
    .bind(serde_json::to_string(change.metadata())?)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Drops held events that `event` makes obsolete
///
/// A held event is obsolete once a newer event lands on its path, or once
/// a newer delete or rename removes one of its ancestors.
async fn drop_superseded(conn: &mut SqliteConnection, event: &ServerEvent) -> Result<u64, IndexError> {
    let removes_subtree = matches!(event.kind, ChangeKind::Deleted | ChangeKind::Renamed);
    let mut dropped = 0;
    for path in std::iter::once(&event.path).chain(event.from_path.iter()) {
        let (prefix, len) = subtree_prefix(path);
        dropped += sqlx::query(
            "DELETE FROM deferred_events WHERE event_id < ? \
             AND (path = ? OR (? AND substr(path, 1, ?) = ?))",
        )
        .bind(event.event_id.as_i64())
        .bind(path.as_str())
        .bind(removes_subtree)
        .bind(len)
        .bind(&prefix)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(dropped)
}

/// Moves `from` and everything below it to `to`, replacing rows at the destination
async fn move_subtree(
    conn: &mut SqliteConnection,
    from: &RelativePath,
    to: &RelativePath,
    root: &Path,
) -> Result<(), IndexError> {
    let mut moving = Vec::new();
    if let Some(record) = fetch_record(conn, from).await? {
        moving.push(record);
    }
    moving.extend(fetch_subtree(conn, from).await?);

    // Clear the destination subtree first so moved rows replace it
    delete_record(conn, to).await?;
    for stale in fetch_subtree(conn, to).await? {
        delete_record(conn, &stale.relative_path).await?;
    }

    for mut record in moving {
        let Some(new_path) = record.relative_path.rebase(from, to) else {
            continue;
        };
        delete_record(conn, &record.relative_path).await?;
        record.local_path = new_path.to_local(root);
        record.relative_path = new_path;
        write_record(conn, &record).await?;
    }
    Ok(())
}

/// Compares a change's base revision with the record it lands on
///
/// Returns a conflict reason when the record moved past the base revision
/// and the content at the base revision differs from the current content.
async fn base_divergence(
    conn: &mut SqliteConnection,
    change: &FileChange,
    record: &IndexRecord,
) -> Result<Option<String>, IndexError> {
    let base = change.metadata().revision;
    let current = record.metadata.revision;
    if base == current {
        return Ok(None);
    }

    let historical: Option<String> = sqlx::query_scalar(
        "SELECT metadata FROM record_history WHERE relative_path = ? AND revision = ?",
    )
    .bind(record.relative_path.as_str())
    .bind(base as i64)
    .fetch_optional(&mut *conn)
    .await?;

    let diverged = match historical {
        Some(json) => {
            let at_base: FileMetadata = serde_json::from_str(&json)?;
            !at_base.same_content(&record.metadata)
        }
        None => !change.metadata().same_content(&record.metadata),
    };

    Ok(diverged.then(|| {
        format!(
            "{} changed on the server (base revision {base}, current {current})",
            record.relative_path
        )
    }))
}

/// Re-checks a change that is already pending against its record
///
/// The record still carries the change's own content unless something
/// else was written over it since the first merge.
async fn remerge_divergence(
    conn: &mut SqliteConnection,
    id: ChangeId,
    change: &FileChange,
) -> Result<Option<String>, IndexError> {
    if !matches!(change.kind(), ChangeKind::Created | ChangeKind::Modified) {
        return Ok(None);
    }
    let Some(record) = fetch_record(conn, change.path()).await? else {
        return Ok(None);
    };
    if record.pending_change_id != Some(id)
        || !record.is_live()
        || record.metadata.same_content(change.metadata())
    {
        return Ok(None);
    }
    base_divergence(conn, change, &record).await
}

async fn merge_upsert(
    conn: &mut SqliteConnection,
    id: ChangeId,
    change: &FileChange,
    root: &Path,
) -> Result<MergeDecision, IndexError> {
    let path = change.path();
    let existing = fetch_record(conn, path).await?;

    if let Some(record) = &existing {
        if let Some(other) = record.pending_change_id {
            return Ok(MergeDecision::Conflict(format!(
                "change {other} already in flight on {path}"
            )));
        }
        if record.is_live() {
            if record.is_folder() != change.is_folder() {
                return Ok(MergeDecision::Conflict(format!(
                    "{path} is a {} in the index but the change describes a {}",
                    kind_name(record.is_folder()),
                    kind_name(change.is_folder())
                )));
            }
            if record.metadata.same_content(change.metadata()) {
                return Ok(MergeDecision::Skipped);
            }
            if let Some(reason) = base_divergence(conn, change, record).await? {
                return Ok(MergeDecision::Conflict(reason));
            }
        }
    }

    let mut metadata = change.metadata().clone();
    if let Some(record) = &existing {
        metadata.revision = record.metadata.revision;
        if metadata.storage_key.is_none() {
            metadata.storage_key = record.metadata.storage_key.clone();
        }
    }

    write_record(
        conn,
        &IndexRecord {
            relative_path: path.clone(),
            local_path: path.to_local(root),
            metadata,
            last_event_id: existing.as_ref().and_then(|r| r.last_event_id),
            pending_change_id: Some(id),
            deleted: false,
        },
    )
    .await?;
    Ok(MergeDecision::Merged)
}

async fn merge_delete(
    conn: &mut SqliteConnection,
    id: ChangeId,
    change: &FileChange,
) -> Result<MergeDecision, IndexError> {
    let path = change.path();
    let Some(mut record) = fetch_record(conn, path).await? else {
        return Ok(MergeDecision::Skipped);
    };
    if let Some(other) = record.pending_change_id {
        return Ok(MergeDecision::Conflict(format!(
            "change {other} already in flight on {path}"
        )));
    }
    if record.deleted {
        return Ok(MergeDecision::Skipped);
    }

    record.deleted = true;
    record.pending_change_id = Some(id);
    write_record(conn, &record).await?;

    for mut nested in fetch_subtree(conn, path).await? {
        nested.deleted = true;
        if nested.pending_change_id.is_none() {
            nested.pending_change_id = Some(id);
        }
        write_record(conn, &nested).await?;
    }
    Ok(MergeDecision::Merged)
}

async fn merge_rename(
    conn: &mut SqliteConnection,
    id: ChangeId,
    change: &FileChange,
    root: &Path,
) -> Result<MergeDecision, IndexError> {
    let to = change.path();
    let Some(from) = change.from_path() else {
        return Ok(MergeDecision::Conflict("rename has no source path".to_string()));
    };

    let source = fetch_record(conn, from).await?.filter(IndexRecord::is_live);
    let destination = fetch_record(conn, to).await?;

    if let Some(dest) = &destination {
        if let Some(other) = dest.pending_change_id {
            return Ok(MergeDecision::Conflict(format!(
                "rename destination {to} is occupied by in-flight change {other}"
            )));
        }
    }

    let Some(source) = source else {
        // The tree may already reflect this rename (a remote rename echoed back)
        if let Some(dest) = &destination {
            if dest.is_live() && dest.metadata.same_content(change.metadata()) {
                return Ok(MergeDecision::Skipped);
            }
        }
        return Ok(MergeDecision::Conflict(format!("rename source {from} is missing")));
    };

    // A pending change at the source was ordered before this rename; the
    // moved record is handed over to the rename.
    if source.is_folder() != change.is_folder() {
        return Ok(MergeDecision::Conflict(format!(
            "{from} is a {} in the index but the rename describes a {}",
            kind_name(source.is_folder()),
            kind_name(change.is_folder())
        )));
    }

    move_subtree(conn, from, to, root).await?;

    let mut moved = fetch_record(conn, to)
        .await?
        .ok_or_else(|| IndexError::Corrupted(format!("renamed record {to} vanished")))?;
    let mut metadata = change.metadata().clone();
    metadata.revision = source.metadata.revision;
    metadata.storage_key = source.metadata.storage_key.clone();
    if metadata.hash.is_none() && !metadata.is_folder {
        metadata.hash = source.metadata.hash.clone();
    }
    moved.metadata = metadata;
    moved.pending_change_id = Some(id);
    write_record(conn, &moved).await?;
    Ok(MergeDecision::Merged)
}

fn kind_name(is_folder: bool) -> &'static str {
    if is_folder {
        "folder"
    } else {
        "file"
    }
}

// ============================================================================
// ILocalIndex implementation
// ============================================================================

#[async_trait::async_trait]
impl ILocalIndex for SqliteLocalIndex {
    #[tracing::instrument(skip(self, batch), fields(count = batch.len()))]
    async fn merge_changes(&self, batch: &[FileChange]) -> anyhow::Result<MergeOutcome> {
        let _writer = self.writer.lock().await;
        let root = self.root().await;
        let mut outcome = MergeOutcome::default();

        for change in batch {
            let locks = self.locks_for(change.touched_paths());
            let mut guards = Vec::with_capacity(locks.len());
            for lock in &locks {
                guards.push(lock.write().await);
            }

            match self.merge_one(change, &root).await? {
                MergeDecision::Merged => {
                    let mut merged = change.clone();
                    if merged.can_transition_to(ChangeState::InFlight) {
                        merged.transition_to(ChangeState::InFlight)?;
                    }
                    tracing::debug!(change_id = ?change.id(), path = %change.path(), "Merged change");
                    outcome.merged.push(merged);
                }
                MergeDecision::Conflict(reason) => {
                    tracing::info!(
                        change_id = ?change.id(),
                        path = %change.path(),
                        reason = %reason,
                        "Change conflicts with index"
                    );
                    outcome.conflicts.push(MergeConflict {
                        change: change.clone(),
                        reason,
                    });
                }
                MergeDecision::Skipped => {
                    tracing::trace!(change_id = ?change.id(), path = %change.path(), "Skipped echo");
                    outcome.skipped.push(change.clone());
                }
            }
        }

        Ok(outcome)
    }

    #[tracing::instrument(skip(self, completed), fields(sync_id = %sync_id, count = completed.len()))]
    async fn complete_sync(
        &self,
        sync_id: &SyncId,
        completed: &[ChangeId],
        new_root: Option<&Path>,
    ) -> anyhow::Result<u64> {
        let _writer = self.writer.lock().await;
        let cursor = self.read_cursor().await?;

        let any_pending = completed.iter().any(|id| cursor.pending_event_ids.contains(id));
        let root_unchanged = new_root.map_or(true, |r| r == cursor.root_path.as_path());
        if cursor.last_sync_id.as_ref() == Some(sync_id) && !any_pending && root_unchanged {
            tracing::debug!(generation = cursor.generation, "Sync point already committed");
            return Ok(cursor.generation);
        }

        let mut tx = self.pool.begin().await?;

        for id in completed {
            if !cursor.pending_event_ids.contains(id) {
                tracing::debug!(change_id = %id, "Completed id was never merged, ignoring");
                continue;
            }
            let raw = id.as_u64() as i64;
            sqlx::query("UPDATE records SET pending_change_id = NULL WHERE pending_change_id = ?")
                .bind(raw)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM pending_events WHERE change_id = ?")
                .bind(raw)
                .execute(&mut *tx)
                .await?;
        }

        let purged = sqlx::query("DELETE FROM records WHERE deleted = 1 AND pending_change_id IS NULL")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut root = self.root.write().await;
        if let Some(new_root) = new_root {
            let paths: Vec<String> = sqlx::query_scalar("SELECT relative_path FROM records")
                .fetch_all(&mut *tx)
                .await?;
            for path in paths {
                let relative = RelativePath::new(&path)
                    .map_err(|e| IndexError::SerializationError(e.to_string()))?;
                sqlx::query("UPDATE records SET local_path = ? WHERE relative_path = ?")
                    .bind(relative.to_local(new_root).to_string_lossy().into_owned())
                    .bind(&path)
                    .execute(&mut *tx)
                    .await?;
            }
            *root = new_root.to_path_buf();
            tracing::info!(root = %new_root.display(), "Relocated index records");
        }

        let generation = cursor.generation + 1;
        sqlx::query(
            "UPDATE sync_cursor SET last_sync_id = ?, generation = ?, root_path = ?, updated_at = ? \
             WHERE id = 1",
        )
        .bind(sync_id.as_str())
        .bind(generation as i64)
        .bind(root.to_string_lossy().into_owned())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(generation, purged, "Committed sync point");
        Ok(generation)
    }

    async fn mark_event_completed_on_previous_sync(&self, event_id: EventId) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO applied_events (event_id, applied_at) VALUES (?, ?)")
            .bind(event_id.as_i64())
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM deferred_events WHERE event_id = ?")
            .bind(event_id.as_i64())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::trace!(event_id = %event_id, "Marked event applied");
        Ok(())
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, path = %event.path))]
    async fn defer_event(&self, event: &ServerEvent, reason: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO deferred_events \
             (event_id, path, from_path, event, reason, attempts, deferred_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?) \
             ON CONFLICT (event_id) DO UPDATE SET \
             reason = excluded.reason, attempts = attempts + 1, deferred_at = excluded.deferred_at",
        )
        .bind(event.event_id.as_i64())
        .bind(event.path.as_str())
        .bind(event.from_path.as_ref().map(|p| p.as_str().to_string()))
        .bind(serde_json::to_string(event).map_err(IndexError::from)?)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        tracing::debug!(reason, "Deferred server event");
        Ok(())
    }

    async fn deferred_events(&self) -> anyhow::Result<Vec<DeferredEvent>> {
        let rows = sqlx::query("SELECT event, reason, attempts FROM deferred_events ORDER BY event_id")
            .fetch_all(&self.pool)
            .await?;
        let mut held = Vec::with_capacity(rows.len());
        for row in &rows {
            let event: String = row.get("event");
            let attempts: i64 = row.get("attempts");
            held.push(DeferredEvent {
                event: serde_json::from_str(&event).map_err(IndexError::from)?,
                reason: row.get("reason"),
                attempts: attempts as u32,
            });
        }
        Ok(held)
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, path = %event.path))]
    async fn apply_server_event(&self, event: &ServerEvent, origin: EventOrigin) -> anyhow::Result<()> {
        let _writer = self.writer.lock().await;
        let root = self.root().await;

        let paths = std::iter::once(&event.path).chain(event.from_path.iter());
        let locks = self.locks_for(paths);
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.write().await);
        }

        let mut tx = self.pool.begin().await?;

        match (origin, event.kind) {
            (EventOrigin::Local(_), ChangeKind::Deleted) => {
                sqlx::query("UPDATE records SET last_event_id = ? WHERE relative_path = ?")
                    .bind(event.event_id.as_i64())
                    .bind(event.path.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
            (EventOrigin::Local(id), _) => {
                if let Some(mut record) = fetch_record(&mut tx, &event.path).await? {
                    if record.pending_change_id != Some(id) {
                        tracing::debug!(
                            change_id = %id,
                            pending = ?record.pending_change_id,
                            "Acknowledged change no longer owns the record"
                        );
                    }
                    record.metadata = event.metadata.clone();
                    record.last_event_id = Some(event.event_id);
                    write_record(&mut tx, &record).await?;
                }
                record_history(&mut tx, &event.path, &event.metadata).await?;
            }
            (EventOrigin::Remote, ChangeKind::Created | ChangeKind::Modified) => {
                let existing = fetch_record(&mut tx, &event.path).await?;
                write_record(
                    &mut tx,
                    &IndexRecord {
                        relative_path: event.path.clone(),
                        local_path: event.path.to_local(&root),
                        metadata: event.metadata.clone(),
                        last_event_id: Some(event.event_id),
                        pending_change_id: existing.and_then(|r| r.pending_change_id),
                        deleted: false,
                    },
                )
                .await?;
                record_history(&mut tx, &event.path, &event.metadata).await?;
            }
            (EventOrigin::Remote, ChangeKind::Deleted) => {
                for nested in fetch_subtree(&mut tx, &event.path).await? {
                    delete_record(&mut tx, &nested.relative_path).await?;
                }
                delete_record(&mut tx, &event.path).await?;
            }
            (EventOrigin::Remote, ChangeKind::Renamed) => {
                let Some(from) = &event.from_path else {
                    return Err(IndexError::Corrupted(format!(
                        "server rename event {} has no source path",
                        event.event_id
                    ))
                    .into());
                };
                move_subtree(&mut tx, from, &event.path, &root).await?;
                let existing = fetch_record(&mut tx, &event.path).await?;
                write_record(
                    &mut tx,
                    &IndexRecord {
                        relative_path: event.path.clone(),
                        local_path: event.path.to_local(&root),
                        metadata: event.metadata.clone(),
                        last_event_id: Some(event.event_id),
                        pending_change_id: existing.and_then(|r| r.pending_change_id),
                        deleted: false,
                    },
                )
                .await?;
                record_history(&mut tx, &event.path, &event.metadata).await?;
            }
        }

        let dropped = drop_superseded(&mut tx, event).await?;
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped superseded deferred events");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn is_event_applied(&self, event_id: EventId) -> anyhow::Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT event_id FROM applied_events WHERE event_id = ?")
                .bind(event_id.as_i64())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn lookup_metadata(
        &self,
        path: &RelativePath,
        revision: u64,
    ) -> anyhow::Result<Option<FileMetadata>> {
        let lock = self.path_lock(path);
        let _guard = lock.read().await;

        let historical: Option<String> = sqlx::query_scalar(
            "SELECT metadata FROM record_history WHERE relative_path = ? AND revision = ?",
        )
        .bind(path.as_str())
        .bind(revision as i64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(json) = historical {
            return Ok(Some(serde_json::from_str(&json)?));
        }

        let row = sqlx::query("SELECT * FROM records WHERE relative_path = ? AND revision = ?")
            .bind(path.as_str())
            .bind(revision as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .as_ref()
            .map(record_from_row)
            .transpose()?
            .map(|r| r.metadata))
    }

    async fn get_record(&self, path: &RelativePath) -> anyhow::Result<Option<IndexRecord>> {
        let lock = self.path_lock(path);
        let _guard = lock.read().await;

        let row = sqlx::query("SELECT * FROM records WHERE relative_path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn records_under(&self, path: &RelativePath) -> anyhow::Result<Vec<IndexRecord>> {
        let (prefix, len) = subtree_prefix(path);
        let rows = sqlx::query(
            "SELECT * FROM records WHERE substr(relative_path, 1, ?) = ? AND relative_path != '/' \
             AND deleted = 0 ORDER BY relative_path",
        )
        .bind(len)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn cursor(&self) -> anyhow::Result<SyncCursor> {
        Ok(self.read_cursor().await?)
    }

    async fn pending_records(&self) -> anyhow::Result<Vec<FileChange>> {
        let rows = sqlx::query("SELECT * FROM pending_events ORDER BY change_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(pending_change_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn max_change_id(&self) -> anyhow::Result<Option<ChangeId>> {
        let max: i64 = sqlx::query_scalar("SELECT max_change_id FROM sync_cursor WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok((max > 0).then(|| ChangeId::new(max as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_prefix_for_root_and_folder() {
        assert_eq!(subtree_prefix(&RelativePath::root()), ("/".to_string(), 1));
        assert_eq!(
            subtree_prefix(&RelativePath::new("/dócs").unwrap()),
            ("/dócs/".to_string(), 6)
        );
    }
}
