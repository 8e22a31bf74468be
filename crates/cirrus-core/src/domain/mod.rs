//! Domain entities and business logic
//!
//! This module contains the core domain types for Cirrus:
//! - Newtypes for identifiers, opaque server tokens and relative paths
//! - File changes and their lifecycle
//! - Index records and the sync cursor
//! - Server events
//! - Failure bookkeeping for retries
//! - Domain-specific error types

pub mod change;
pub mod errors;
pub mod event;
pub mod failure;
pub mod newtypes;
pub mod record;

// Re-export commonly used types
pub use change::{ChangeKind, ChangeState, FileChange, FileMetadata};
pub use errors::DomainError;
pub use event::ServerEvent;
pub use failure::{FailedChange, FailureReason, FailureSet};
pub use newtypes::*;
pub use record::{IndexRecord, SyncCursor};
