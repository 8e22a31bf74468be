//! Cirrus Sync - Change tracking and synchronization engine
//!
//! Provides:
//! - An ordered change queue fed by the filesystem watcher
//! - Dependency resolution, coalescing and ordering of queued changes
//! - The push/pull synchronization state machine
//! - Background tasks that drive it (worker, notification listener)
//!
//! ## Modules
//!
//! - [`queue`] - Ordered in-memory change queue
//! - [`resolver`] - Converts queued changes into a dependency-respecting batch
//! - [`engine`] - Sync cycle orchestration and crash recovery
//! - [`worker`] - Debounced trigger loop that runs sync cycles
//! - [`watcher`] - Filesystem watcher and change ingestion
//! - [`notification`] - Server push listener
//! - [`applier`] - Local filesystem applier for server events
//! - [`echo`] - Suppression of watcher events caused by our own writes
//! - [`backoff`] - Retry delays for failed changes

pub mod applier;
pub mod backoff;
pub mod echo;
pub mod engine;
pub mod hashing;
pub mod notification;
pub mod queue;
pub mod resolver;
pub mod watcher;
pub mod worker;

use std::fmt;

use thiserror::Error;

/// Errors that can occur during synchronization
#[derive(Debug, Error)]
pub enum SyncError {
    /// Timeout, 5xx or connection failure; retried with backoff
    #[error("Transient error: {0}")]
    Transient(String),

    /// Divergent metadata or a dependency cycle, isolated to one change
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed change, dropped and never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Index corruption or unrecoverable I/O
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// A previous fatal error stopped the engine
    #[error("Engine halted: {0}")]
    EngineHalted(String),

    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A domain-level error propagated from cirrus-core
    #[error("Domain error: {0}")]
    DomainError(#[from] cirrus_core::domain::DomainError),
}

impl SyncError {
    /// Returns true if the error must stop the engine
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_) | SyncError::EngineHalted(_))
    }

    /// Returns true if retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::IoError(_))
    }
}

/// Non-fatal errors collected over one sync cycle
#[derive(Debug, Default)]
pub struct CompositeError {
    errors: Vec<SyncError>,
}

impl CompositeError {
    /// Creates an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an error
    pub fn push(&mut self, error: SyncError) {
        self.errors.push(error);
    }

    /// Number of collected errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns true if nothing went wrong
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterates over the collected errors
    pub fn iter(&self) -> impl Iterator<Item = &SyncError> {
        self.errors.iter()
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) during sync cycle", self.errors.len())?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {}

impl IntoIterator for CompositeError {
    type Item = SyncError;
    type IntoIter = std::vec::IntoIter<SyncError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}
