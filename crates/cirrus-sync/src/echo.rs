//! Suppression of watcher events caused by our own writes
//!
//! When the engine applies a server event it registers the touched paths
//! here first. The watcher ingestor consults the suppressor and drops the
//! matching OS notifications instead of re-enqueueing the client's own write.

use std::time::{Duration, Instant};

use cirrus_core::domain::RelativePath;
use dashmap::DashMap;
use tracing::debug;

/// How long a registered path suppresses watcher events by default
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Paths recently written by the engine
#[derive(Debug)]
pub struct EchoSuppressor {
    entries: DashMap<RelativePath, Instant>,
    window: Duration,
}

impl EchoSuppressor {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    /// Marks `path` as about to be written by the engine
    pub fn register(&self, path: &RelativePath) {
        self.entries.insert(path.clone(), Instant::now() + self.window);
    }

    /// Returns true if a watcher event on `path` is our own echo
    ///
    /// Events for the path or anything below it are suppressed until the
    /// window registered for it runs out.
    pub fn should_suppress(&self, path: &RelativePath) -> bool {
        let now = Instant::now();
        self.entries.retain(|_, expires| *expires > now);

        let suppressed = self
            .entries
            .iter()
            .any(|entry| path.is_within(entry.key()));
        if suppressed {
            debug!(path = %path, "Suppressing watcher echo");
        }
        suppressed
    }

    /// Number of paths currently registered
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no path is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EchoSuppressor {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_WINDOW)
    }
}
