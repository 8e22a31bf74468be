//! FileChange domain entity
//!
//! A [`FileChange`] is the atomic unit of synchronization work: one observed
//! (or recovered) filesystem operation on a single path.
//!
//! ## Lifecycle
//!
//! ```text
//!   ┌────────┐  resolve   ┌──────────┐   ack    ┌───────────┐
//!   │ Queued │ ─────────► │ InFlight │ ───────► │ Completed │
//!   └────────┘            └──────────┘          └───────────┘
//!       │  ▲                   │
//!       │  │ requeue           │ conflict / network / reject
//!       ▼  │                   ▼
//!   ┌──────────────────────────────┐
//!   │            Failed            │ ── retry due ──► InFlight
//!   └──────────────────────────────┘
//! ```
//!
//! Dependencies between changes are not stored on the change itself; the
//! resolver keeps them as id pairs in its own adjacency set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{ChangeId, FileHash, RelativePath, StorageKey};

// ============================================================================
// ChangeKind
// ============================================================================

/// The kind of filesystem operation a change represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new file or folder appeared
    Created,
    /// File contents or attributes changed
    Modified,
    /// The file or folder was removed
    Deleted,
    /// Moved from `from_path` to `path`
    Renamed,
}

impl ChangeKind {
    /// Returns the kind name as a static string
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::Created => "Created",
            ChangeKind::Modified => "Modified",
            ChangeKind::Deleted => "Deleted",
            ChangeKind::Renamed => "Renamed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Renamed => write!(f, "renamed"),
        }
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "deleted" => Ok(ChangeKind::Deleted),
            "renamed" => Ok(ChangeKind::Renamed),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown change kind: {other}"
            ))),
        }
    }
}

// ============================================================================
// ChangeState
// ============================================================================

/// Processing state of a [`FileChange`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    /// Waiting in the change queue
    #[default]
    Queued,
    /// Merged into the index and sent (or about to be sent) to the server
    InFlight,
    /// Held in the failure set awaiting retry
    Failed,
    /// Acknowledged by the server and committed
    Completed,
}

impl ChangeState {
    /// Returns the state name as a static string
    pub fn name(&self) -> &'static str {
        match self {
            ChangeState::Queued => "Queued",
            ChangeState::InFlight => "InFlight",
            ChangeState::Failed => "Failed",
            ChangeState::Completed => "Completed",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// FileMetadata
// ============================================================================

/// Last-known metadata of a file or folder
///
/// `revision` is the server revision the change was based on; zero for
/// paths the server has never seen. `storage_key` is assigned by the server
/// and stays `None` until the first successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Content hash (None for folders)
    #[serde(default)]
    pub hash: Option<FileHash>,
    /// Size in bytes (0 for folders)
    #[serde(default)]
    pub size: u64,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// Last modification timestamp
    pub modified: DateTime<Utc>,
    /// Whether this entry is a folder
    #[serde(default)]
    pub is_folder: bool,
    /// Server revision
    #[serde(default)]
    pub revision: u64,
    /// Server-assigned storage key
    #[serde(default)]
    pub storage_key: Option<StorageKey>,
}

impl FileMetadata {
    /// Metadata for a regular file
    pub fn file(hash: FileHash, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            hash: Some(hash),
            size,
            created: modified,
            modified,
            is_folder: false,
            revision: 0,
            storage_key: None,
        }
    }

    /// Metadata for a folder
    pub fn folder(modified: DateTime<Utc>) -> Self {
        Self {
            hash: None,
            size: 0,
            created: modified,
            modified,
            is_folder: true,
            revision: 0,
            storage_key: None,
        }
    }

    /// Returns a copy based on the given server revision
    #[must_use]
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Returns a copy carrying the given storage key
    #[must_use]
    pub fn with_storage_key(mut self, key: StorageKey) -> Self {
        self.storage_key = Some(key);
        self
    }

    /// Returns true if both describe the same content
    ///
    /// Timestamps and server bookkeeping are ignored.
    pub fn same_content(&self, other: &FileMetadata) -> bool {
        self.is_folder == other.is_folder && self.hash == other.hash && self.size == other.size
    }
}

// ============================================================================
// FileChange
// ============================================================================

/// A single file change awaiting synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    id: Option<ChangeId>,
    kind: ChangeKind,
    path: RelativePath,
    from_path: Option<RelativePath>,
    metadata: FileMetadata,
    state: ChangeState,
}

impl FileChange {
    /// Creates a new queued change without an id
    pub fn new(kind: ChangeKind, path: RelativePath, metadata: FileMetadata) -> Self {
        Self {
            id: None,
            kind,
            path,
            from_path: None,
            metadata,
            state: ChangeState::Queued,
        }
    }

    /// Creates a queued rename from `from_path` to `path`
    pub fn renamed(from_path: RelativePath, path: RelativePath, metadata: FileMetadata) -> Self {
        Self {
            from_path: Some(from_path),
            ..Self::new(ChangeKind::Renamed, path, metadata)
        }
    }

    /// Returns a copy carrying the given id
    #[must_use]
    pub fn with_id(mut self, id: ChangeId) -> Self {
        self.id = Some(id);
        self
    }

    /// Returns the change id, if one has been assigned
    pub fn id(&self) -> Option<ChangeId> {
        self.id
    }

    /// Assigns an id unless one is already present
    ///
    /// Returns true if the id was assigned.
    pub fn assign_id(&mut self, id: ChangeId) -> bool {
        if self.id.is_some() {
            return false;
        }
        self.id = Some(id);
        true
    }

    /// Returns the change kind
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Returns the target path
    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    /// Returns the rename source path
    pub fn from_path(&self) -> Option<&RelativePath> {
        self.from_path.as_ref()
    }

    /// Returns the metadata
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Returns true if the change targets a folder
    pub fn is_folder(&self) -> bool {
        self.metadata.is_folder
    }

    /// Returns the current state
    pub fn state(&self) -> ChangeState {
        self.state
    }

    /// Replaces the metadata
    pub fn set_metadata(&mut self, metadata: FileMetadata) {
        self.metadata = metadata;
    }

    /// Checks that the change is well formed
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if:
    /// - The path is the sync root
    /// - A rename has no source path, or renames onto itself
    /// - A non-rename carries a source path
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.path.is_root() {
            return Err(DomainError::ValidationFailed(format!(
                "{} change targets the sync root",
                self.kind.name()
            )));
        }
        match (self.kind, &self.from_path) {
            (ChangeKind::Renamed, None) => Err(DomainError::ValidationFailed(format!(
                "Rename to {} has no source path",
                self.path
            ))),
            (ChangeKind::Renamed, Some(from)) if from.is_root() => Err(
                DomainError::ValidationFailed("Rename source is the sync root".to_string()),
            ),
            (ChangeKind::Renamed, Some(from)) if from == &self.path => Err(
                DomainError::ValidationFailed(format!("Rename of {} onto itself", self.path)),
            ),
            (ChangeKind::Renamed, Some(from)) if from.is_ancestor_of(&self.path) => {
                Err(DomainError::ValidationFailed(format!(
                    "Rename of {from} into its own subtree"
                )))
            }
            (ChangeKind::Renamed, Some(_)) => Ok(()),
            (_, Some(from)) => Err(DomainError::ValidationFailed(format!(
                "{} change carries a source path {from}",
                self.kind.name()
            ))),
            (_, None) => Ok(()),
        }
    }

    /// Returns every path this change touches (target, and source for renames)
    pub fn touched_paths(&self) -> impl Iterator<Item = &RelativePath> {
        std::iter::once(&self.path).chain(self.from_path.iter())
    }

    /// Checks if a transition to the target state is valid
    pub fn can_transition_to(&self, target: ChangeState) -> bool {
        matches!(
            (self.state, target),
            (ChangeState::Queued, ChangeState::InFlight)
                | (ChangeState::Queued, ChangeState::Failed)
                | (ChangeState::InFlight, ChangeState::Completed)
                | (ChangeState::InFlight, ChangeState::Failed)
                | (ChangeState::Failed, ChangeState::Queued)
                | (ChangeState::Failed, ChangeState::InFlight)
        )
    }

    /// Transitions to a new state
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidState` if the transition is not allowed,
    /// e.g. `Queued` straight to `Completed`.
    pub fn transition_to(&mut self, target: ChangeState) -> Result<(), DomainError> {
        if !self.can_transition_to(target) {
            return Err(DomainError::InvalidState {
                from: self.state.name().to_string(),
                to: target.name().to_string(),
            });
        }
        self.state = target;
        Ok(())
    }

    /// Forces the state without validation
    ///
    /// Used when rebuilding changes from persisted index records.
    pub fn restore_state(&mut self, state: ChangeState) {
        self.state = state;
    }
}

impl fmt::Display for FileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{id} ")?,
            None => write!(f, "#? ")?,
        }
        match &self.from_path {
            Some(from) => write!(f, "{} {} -> {}", self.kind, from, self.path),
            None => write!(f, "{} {}", self.kind, self.path),
        }
    }
}
