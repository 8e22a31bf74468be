//! Server events
//!
//! A [`ServerEvent`] is the remote-authoritative counterpart of a
//! [`FileChange`](super::change::FileChange). The server returns one for
//! every change it accepted (an acknowledgement, carrying the originating
//! client and change id) and one for every change made elsewhere.

use serde::{Deserialize, Serialize};

use super::change::{ChangeKind, FileMetadata};
use super::newtypes::{ChangeId, ClientId, EventId, RelativePath, SyncId};

/// An authoritative change reported by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Server-assigned event id
    pub event_id: EventId,
    /// Sync point this event belongs to
    pub sync_id: SyncId,
    /// Operation kind
    pub kind: ChangeKind,
    /// Target path
    pub path: RelativePath,
    /// Source path for renames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<RelativePath>,
    /// Authoritative metadata after the event
    pub metadata: FileMetadata,
    /// Client that produced the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_client: Option<ClientId>,
    /// Local change id on the originating client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_change_id: Option<ChangeId>,
}

impl ServerEvent {
    /// Returns the local change this event acknowledges, if it came from `client`
    pub fn acknowledges(&self, client: &ClientId) -> Option<ChangeId> {
        match (&self.origin_client, self.origin_change_id) {
            (Some(origin), Some(id)) if origin == client => Some(id),
            _ => None,
        }
    }

    /// Returns true if the event originated on another client
    pub fn is_foreign(&self, client: &ClientId) -> bool {
        self.acknowledges(client).is_none()
    }
}
