//! Index database setup
//!
//! Opens the SQLite file backing the local index and brings its schema up
//! to date. Schema versions are tracked in `PRAGMA user_version`; each
//! migration runs once, inside its own transaction.
//!
//! The cursor commit is the point the client resumes from after a crash, so
//! file databases run with `synchronous = FULL` on top of WAL.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::IndexError;

/// Ordered schema migrations; the position plus one is the schema version
const MIGRATIONS: &[(&str, &str)] = &[
    ("initial", include_str!("migrations/20240601_initial.sql")),
    (
        "deferred_events",
        include_str!("migrations/20241016_deferred_events.sql"),
    ),
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool over the index database
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the index database at `db_path`
    ///
    /// # Errors
    ///
    /// `IndexError::ConnectionFailed` if the directory or database cannot be
    /// opened, `IndexError::MigrationFailed` if the schema cannot be upgraded.
    pub async fn new(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IndexError::ConnectionFailed(format!(
                    "Failed to create index directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = index_options(SqliteConnectOptions::new().filename(db_path))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // One writer at a time is enforced by the index itself; the extra
        // connections serve lookups.
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                IndexError::ConnectionFailed(format!(
                    "Failed to open index at {}: {e}",
                    db_path.display()
                ))
            })?;

        let version = migrate(&pool).await?;
        tracing::info!(path = %db_path.display(), schema_version = version, "Index database opened");
        Ok(Self { pool })
    }

    /// Opens a private in-memory index
    ///
    /// The pool holds exactly one connection that is never recycled, since
    /// an in-memory database lives and dies with its connection.
    pub async fn in_memory() -> Result<Self, IndexError> {
        let base = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| IndexError::ConnectionFailed(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(index_options(base))
            .await
            .map_err(|e| {
                IndexError::ConnectionFailed(format!("Failed to open in-memory index: {e}"))
            })?;

        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Schema version currently recorded in the database
    pub async fn schema_version(&self) -> Result<u32, IndexError> {
        schema_version(&self.pool).await
    }
}

/// Settings shared by file and in-memory databases
fn index_options(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT)
}

async fn schema_version(pool: &SqlitePool) -> Result<u32, IndexError> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    Ok(version as u32)
}

/// Applies every migration newer than the recorded schema version
///
/// Returns the resulting version.
async fn migrate(pool: &SqlitePool) -> Result<u32, IndexError> {
    let current = schema_version(pool).await?;
    let latest = MIGRATIONS.len() as u32;
    if current > latest {
        return Err(IndexError::MigrationFailed(format!(
            "index schema version {current} is newer than this build supports ({latest})"
        )));
    }

    for (offset, (name, sql)) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = offset as u32 + 1;
        let failed = |e: sqlx::Error| {
            IndexError::MigrationFailed(format!("migration {version} ({name}): {e}"))
        };

        let mut tx = pool.begin().await.map_err(failed)?;
        sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(failed)?;
        sqlx::raw_sql(&format!("PRAGMA user_version = {version}"))
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
        tx.commit().await.map_err(failed)?;

        tracing::debug!(version, name = *name, "Applied index migration");
    }

    Ok(latest)
}
