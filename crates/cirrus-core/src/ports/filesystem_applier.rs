//! Filesystem applier port (driven/secondary port)
//!
//! Materializes server events on the local filesystem. The engine updates
//! the index before calling [`IFilesystemApplier::apply`], so an applier
//! only has to make the disk match the event.

use crate::domain::ServerEvent;

/// Port trait for applying remote events to the local tree
#[async_trait::async_trait]
pub trait IFilesystemApplier: Send + Sync {
    /// Applies one event. Applying an event whose effect is already present
    /// must succeed.
    async fn apply(&self, event: &ServerEvent) -> anyhow::Result<()>;
}
