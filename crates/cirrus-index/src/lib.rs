//! Cirrus Index - Durable local index
//!
//! SQLite-based persistence for:
//! - Per-path records with last-known metadata and pending markers
//! - Revision history used to confirm divergence
//! - The sync cursor
//! - The log of merged-but-unconfirmed local changes
//! - The set of server events already applied to disk
//!
//! ## Architecture
//!
//! This crate implements the `ILocalIndex` port from `cirrus-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteLocalIndex`] - Full `ILocalIndex` implementation
//! - [`IndexError`] - Error types for index operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use cirrus_index::{DatabasePool, SqliteLocalIndex};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/cirrus/index.db")).await?;
//! let index = SqliteLocalIndex::new(pool.pool().clone(), PathBuf::from("/home/user/Cirrus"));
//! // Use index as ILocalIndex...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteLocalIndex;

/// Errors that can occur during index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stored data violates an index invariant
    #[error("Index corrupted: {0}")]
    Corrupted(String),
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        IndexError::QueryFailed(e.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::SerializationError(e.to_string())
    }
}
