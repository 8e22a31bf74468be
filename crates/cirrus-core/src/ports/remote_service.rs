//! Remote service port (driven/secondary port)
//!
//! This module defines the push/pull protocol spoken with the sync server
//! and the payloads exchanged. Payloads are port-level DTOs; optional
//! response fields default when absent.
//!
//! ## Design Notes
//!
//! - Methods return `anyhow::Result`. Adapters wrap failures in
//!   [`RemoteError`] so callers can downcast and classify them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    newtypes::{ChangeId, ClientId, RelativePath, StorageKey, SyncId},
    ChangeKind, FileChange, FileMetadata, ServerEvent,
};

// ============================================================================
// Errors
// ============================================================================

/// Failures talking to the remote service
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request did not complete in time
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// 5xx or 429 response
    #[error("Service unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The server refused the request
    #[error("Request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Response could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Returns true if retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout(_) | RemoteError::Network(_) | RemoteError::Unavailable { .. }
        )
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// One local change as sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireChange {
    pub kind: ChangeKind,
    pub path: RelativePath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<RelativePath>,
    pub metadata: FileMetadata,
    pub change_id: ChangeId,
}

impl WireChange {
    /// Converts a change with an assigned id
    pub fn from_change(change: &FileChange) -> Option<Self> {
        Some(Self {
            kind: change.kind(),
            path: change.path().clone(),
            from_path: change.from_path().cloned(),
            metadata: change.metadata().clone(),
            change_id: change.id()?,
        })
    }
}

/// Sync_To request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub relative_root_path: String,
    pub last_sync_id: Option<SyncId>,
    pub client_id: ClientId,
    pub events: Vec<WireChange>,
}

/// A change the server refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedChange {
    pub change_id: ChangeId,
    pub reason: String,
}

/// Sync_To response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub sync_id: SyncId,
    #[serde(default)]
    pub events: Vec<ServerEvent>,
    #[serde(default)]
    pub pending_count: Option<u64>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub rejected: Vec<RejectedChange>,
}

/// Sync_From request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub relative_root_path: String,
    pub last_sync_id: Option<SyncId>,
}

/// Sync_From response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub sync_id: SyncId,
    #[serde(default)]
    pub events: Vec<ServerEvent>,
    #[serde(default)]
    pub partial: bool,
}

/// Metadata query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataQuery {
    pub user_id: String,
    pub path: RelativePath,
    pub is_folder: bool,
}

// ============================================================================
// IRemoteService trait
// ============================================================================

/// Port trait for the remote sync service
#[async_trait::async_trait]
pub trait IRemoteService: Send + Sync {
    /// Sync_To: pushes local changes, returns acknowledgements and any
    /// concurrently arrived remote events
    async fn push(&self, request: &PushRequest) -> anyhow::Result<PushResponse>;

    /// Sync_From: fetches remote events after `last_sync_id`
    async fn pull(&self, request: &PullRequest) -> anyhow::Result<PullResponse>;

    /// Server-side metadata for a path, `None` when the server has no content
    async fn query_metadata(&self, query: &MetadataQuery) -> anyhow::Result<Option<FileMetadata>>;

    /// Downloads the content stored under `key`
    async fn fetch_content(&self, key: &StorageKey) -> anyhow::Result<Vec<u8>>;
}
