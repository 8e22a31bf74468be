//! Persisted index state
//!
//! [`IndexRecord`] is one row of the local index, keyed by relative path.
//! [`SyncCursor`] is the process-wide synchronization point.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::change::FileMetadata;
use super::newtypes::{ChangeId, EventId, RelativePath, SyncId};

/// Last-known state of one path under the sync root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Key: path relative to the sync root
    pub relative_path: RelativePath,
    /// Absolute location under the current sync root
    pub local_path: PathBuf,
    /// Last-known metadata
    pub metadata: FileMetadata,
    /// Last server event applied to this path
    pub last_event_id: Option<EventId>,
    /// Change currently in flight for this path
    pub pending_change_id: Option<ChangeId>,
    /// Tombstone kept until the delete is committed
    pub deleted: bool,
}

impl IndexRecord {
    /// Returns true if this record describes a folder
    pub fn is_folder(&self) -> bool {
        self.metadata.is_folder
    }

    /// Returns true if no change is in flight for this path
    pub fn is_idle(&self) -> bool {
        self.pending_change_id.is_none()
    }

    /// Returns true if the path currently exists (not tombstoned)
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Process-wide synchronization cursor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Sync id of the last successful commit
    pub last_sync_id: Option<SyncId>,
    /// Locally-originated change ids not yet confirmed by the server
    pub pending_event_ids: BTreeSet<ChangeId>,
    /// Number of successful commits
    pub generation: u64,
    /// Absolute sync root the records' local paths are based on
    pub root_path: PathBuf,
}

impl SyncCursor {
    /// Returns true if any local change is awaiting confirmation
    pub fn has_pending(&self) -> bool {
        !self.pending_event_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn record_state_helpers() {
        let mut record = IndexRecord {
            relative_path: RelativePath::new("/docs").unwrap(),
            local_path: PathBuf::from("/sync/docs"),
            metadata: FileMetadata::folder(Utc::now()),
            last_event_id: None,
            pending_change_id: None,
            deleted: false,
        };
        assert!(record.is_folder());
        assert!(record.is_idle());
        assert!(record.is_live());

        record.pending_change_id = Some(ChangeId::new(1));
        record.deleted = true;
        assert!(!record.is_idle());
        assert!(!record.is_live());
    }

    #[test]
    fn default_cursor_has_nothing_pending() {
        let mut cursor = SyncCursor::default();
        assert!(!cursor.has_pending());
        assert_eq!(cursor.generation, 0);
        cursor.pending_event_ids.insert(ChangeId::new(4));
        assert!(cursor.has_pending());
    }
}
