//! Ordered in-memory change queue
//!
//! The watcher appends observed changes at the back; the engine puts blocked
//! changes back at the front so they are reconsidered before newer work.
//! Every change gets a [`ChangeId`] on its way in. The counter is seeded from
//! the highest id the local index has recorded, so ids stay unique across
//! restarts.
//!
//! A change keeps its state while queued: one that came back from the
//! failure set stays `Failed`, which tells the resolver it may already be
//! known to the index.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use cirrus_core::domain::{ChangeId, FailureSet, FileChange};
use tracing::debug;

#[derive(Debug)]
struct QueueState {
    items: VecDeque<FileChange>,
    next_id: ChangeId,
}

/// Thread-safe FIFO of pending changes
#[derive(Debug)]
pub struct ChangeQueue {
    state: Mutex<QueueState>,
}

impl ChangeQueue {
    /// Creates an empty queue whose ids start after `highest_known`
    pub fn new(highest_known: Option<ChangeId>) -> Self {
        let next_id = highest_known.map_or(ChangeId::new(1), |id| id.next());
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                next_id,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a batch, assigning ids to changes that have none
    ///
    /// With `insert_at_top` the batch goes in front of everything already
    /// queued, keeping its own relative order. Returns the ids of the batch
    /// in order.
    pub fn enqueue(&self, changes: Vec<FileChange>, insert_at_top: bool) -> Vec<ChangeId> {
        let mut state = self.lock();
        let mut ids = Vec::with_capacity(changes.len());
        let mut prepared = Vec::with_capacity(changes.len());

        for mut change in changes {
            let id = match change.id() {
                Some(id) => {
                    if id >= state.next_id {
                        state.next_id = id.next();
                    }
                    id
                }
                None => {
                    let id = state.next_id;
                    state.next_id = id.next();
                    change.assign_id(id);
                    id
                }
            };
            ids.push(id);
            prepared.push(change);
        }

        if insert_at_top {
            for change in prepared.into_iter().rev() {
                state.items.push_front(change);
            }
        } else {
            state.items.extend(prepared);
        }

        debug!(
            count = ids.len(),
            insert_at_top,
            queued = state.items.len(),
            "Enqueued changes"
        );
        ids
    }

    /// Removes every queued change plus the failures that are due
    ///
    /// Due failures are taken out of `failures`. Queued changes come first,
    /// in queue order.
    pub fn drain(&self, failures: &mut FailureSet, now: DateTime<Utc>) -> Vec<FileChange> {
        let mut state = self.lock();
        let mut drained: Vec<FileChange> = state.items.drain(..).collect();
        let due = failures.take_due(now);
        if !drained.is_empty() || !due.is_empty() {
            debug!(queued = drained.len(), retries = due.len(), "Drained change queue");
        }
        drained.extend(due);
        drained
    }

    /// Number of queued changes
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// The id the next new change will receive
    pub fn peek_next_id(&self) -> ChangeId {
        self.lock().next_id
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cirrus_core::domain::{ChangeKind, ChangeState, FailureReason, FileMetadata, RelativePath};

    use super::*;
    use crate::hashing::hash_bytes;

    fn modified(path: &str) -> FileChange {
        FileChange::new(
            ChangeKind::Modified,
            RelativePath::new(path).unwrap(),
            FileMetadata::file(hash_bytes(path.as_bytes()), 3, Utc::now()),
        )
    }

    fn paths(changes: &[FileChange]) -> Vec<&str> {
        changes.iter().map(|c| c.path().as_str()).collect()
    }

    #[test]
    fn ids_are_assigned_in_order() {
        let queue = ChangeQueue::new(None);
        let ids = queue.enqueue(vec![modified("/a"), modified("/b")], false);
        assert_eq!(ids, vec![ChangeId::new(1), ChangeId::new(2)]);
        assert_eq!(queue.peek_next_id(), ChangeId::new(3));
    }

    #[test]
    fn counter_is_seeded_from_index() {
        let queue = ChangeQueue::new(Some(ChangeId::new(41)));
        let ids = queue.enqueue(vec![modified("/a")], false);
        assert_eq!(ids, vec![ChangeId::new(42)]);
    }

    #[test]
    fn existing_ids_are_kept_and_advance_the_counter() {
        let queue = ChangeQueue::new(None);
        queue.enqueue(vec![modified("/a").with_id(ChangeId::new(10))], false);
        let ids = queue.enqueue(vec![modified("/b")], false);
        assert_eq!(ids, vec![ChangeId::new(11)]);
    }

    #[test]
    fn insert_at_top_preserves_batch_order() {
        let queue = ChangeQueue::new(None);
        queue.enqueue(vec![modified("/new")], false);
        queue.enqueue(vec![modified("/old1"), modified("/old2")], true);

        let drained = queue.drain(&mut FailureSet::new(), Utc::now());
        assert_eq!(paths(&drained), vec!["/old1", "/old2", "/new"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_includes_due_failures_only() {
        let queue = ChangeQueue::new(None);
        let mut failures = FailureSet::new();
        let now = Utc::now();

        failures.insert(
            modified("/due").with_id(ChangeId::new(1)),
            FailureReason::Transient("timeout".into()),
            now,
            |_| Duration::ZERO,
        );
        failures.insert(
            modified("/later").with_id(ChangeId::new(2)),
            FailureReason::Transient("timeout".into()),
            now,
            |_| Duration::from_secs(600),
        );
        queue.enqueue(vec![modified("/fresh")], false);

        let drained = queue.drain(&mut failures, now);
        assert_eq!(paths(&drained), vec!["/fresh", "/due"]);
        assert_eq!(drained[1].state(), ChangeState::Failed);
        assert_eq!(failures.len(), 1);
    }
}
