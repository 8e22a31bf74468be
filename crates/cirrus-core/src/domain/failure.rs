//! Failure bookkeeping for changes awaiting retry
//!
//! The [`FailureSet`] holds changes that could not be synchronized in a
//! previous cycle together with the reason and the earliest time they may
//! be retried. Retry delays are supplied by the caller so the backoff policy
//! stays outside the domain layer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::change::{ChangeState, FileChange};
use super::newtypes::ChangeId;

/// Why a change is not part of the current ready batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Waiting on changes that are not ready
    BlockedOnDependency(Vec<ChangeId>),
    /// Demoted to break a dependency cycle
    DependencyCycle,
    /// Conflicts with index state
    Conflict(String),
    /// Network or server failure
    Transient(String),
    /// Refused by the server
    Rejected(String),
    /// Malformed change, never retried
    Invalid(String),
    /// Was in flight when the process stopped
    Interrupted,
}

impl FailureReason {
    /// Returns a short code for logging
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::BlockedOnDependency(_) => "BLOCKED",
            FailureReason::DependencyCycle => "CYCLE",
            FailureReason::Conflict(_) => "CONFLICT",
            FailureReason::Transient(_) => "TRANSIENT",
            FailureReason::Rejected(_) => "REJECTED",
            FailureReason::Invalid(_) => "INVALID",
            FailureReason::Interrupted => "INTERRUPTED",
        }
    }

    /// Returns true if the change may be retried later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Invalid(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BlockedOnDependency(ids) => {
                write!(f, "blocked on dependency")?;
                for (i, id) in ids.iter().enumerate() {
                    write!(f, "{}{id}", if i == 0 { " " } else { ", " })?;
                }
                Ok(())
            }
            FailureReason::DependencyCycle => write!(f, "dependency cycle"),
            FailureReason::Conflict(msg) => write!(f, "conflict: {msg}"),
            FailureReason::Transient(msg) => write!(f, "transient: {msg}"),
            FailureReason::Rejected(msg) => write!(f, "rejected: {msg}"),
            FailureReason::Invalid(msg) => write!(f, "invalid: {msg}"),
            FailureReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A change held for retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChange {
    /// The change, in state `Failed`
    pub change: FileChange,
    /// Why it failed
    pub reason: FailureReason,
    /// Number of failures recorded for this id
    pub attempts: u32,
    /// Earliest time the change may be retried
    pub next_retry: DateTime<Utc>,
}

/// Changes awaiting retry, keyed by change id
#[derive(Debug, Default, Clone)]
pub struct FailureSet {
    entries: BTreeMap<ChangeId, FailedChange>,
    attempts: HashMap<ChangeId, u32>,
}

impl FailureSet {
    /// Creates an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure and schedules its retry
    ///
    /// `delay_for` receives the attempt number (starting at 0) and returns
    /// the retry delay. Changes without an id are ignored. Returns the
    /// attempt number that was recorded.
    pub fn insert<F>(
        &mut self,
        mut change: FileChange,
        reason: FailureReason,
        now: DateTime<Utc>,
        delay_for: F,
    ) -> Option<u32>
    where
        F: FnOnce(u32) -> StdDuration,
    {
        let id = change.id()?;
        let attempt = self.attempts.get(&id).copied().unwrap_or(0);
        let delay = Duration::from_std(delay_for(attempt)).unwrap_or(Duration::days(1));

        if change.state() != ChangeState::Failed {
            if change.can_transition_to(ChangeState::Failed) {
                let _ = change.transition_to(ChangeState::Failed);
            } else {
                change.restore_state(ChangeState::Failed);
            }
        }

        self.attempts.insert(id, attempt + 1);
        self.entries.insert(
            id,
            FailedChange {
                change,
                reason,
                attempts: attempt + 1,
                next_retry: now + delay,
            },
        );
        Some(attempt)
    }

    /// Removes and returns every change whose retry time has come, by id order
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<FileChange> {
        let due: Vec<ChangeId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.next_retry <= now)
            .map(|(id, _)| *id)
            .collect();

        due.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|entry| entry.change)
            .collect()
    }

    /// Removes a change without retrying it
    pub fn remove(&mut self, id: ChangeId) -> Option<FailedChange> {
        self.entries.remove(&id)
    }

    /// Drops all bookkeeping for a change that has completed
    pub fn forget(&mut self, id: ChangeId) {
        self.entries.remove(&id);
        self.attempts.remove(&id);
    }

    /// Returns true if the change is waiting in the set
    pub fn contains(&self, id: ChangeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns the entry for a change
    pub fn get(&self, id: ChangeId) -> Option<&FailedChange> {
        self.entries.get(&id)
    }

    /// Iterates over waiting changes by id order
    pub fn iter(&self) -> impl Iterator<Item = &FailedChange> {
        self.entries.values()
    }

    /// Earliest scheduled retry
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|e| e.next_retry).min()
    }

    /// Number of waiting changes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
