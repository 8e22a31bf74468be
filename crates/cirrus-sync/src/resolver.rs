//! Dependency resolution for queued changes
//!
//! The [`DependencyResolver`] turns a drained batch of changes, plus the
//! changes still waiting in the failure set, into:
//!
//! - a **ready** batch in an order that respects every dependency,
//! - **blocked** changes, to be queued again for the next cycle,
//! - **rejected** changes, malformed and never retried,
//! - the ids **coalesced** away because a later change superseded them.
//!
//! ## Graph
//!
//! Changes live in an arena keyed by [`ChangeId`]. Dependencies are kept
//! apart from the changes as `(blocker, dependent, seq)` edges, where `seq`
//! records creation order. Edges are derived from paths; "pending" covers
//! both the batch and the failure set:
//!
//! - a change under folder F depends on F's pending `Created`
//! - a change depends on the prior pending change at the same path
//! - a rename depends on prior pending changes at or under its source
//! - a delete depends on pending changes nested under its path
//!
//! ## Ordering
//!
//! Kahn's algorithm, lowest id first. A change is ready only when every
//! blocker is ready earlier in the same batch, and at most one change per
//! target path is ready. A change whose blocker is waiting, blocked or
//! rejected is blocked too. A cycle is broken by demoting the dependent of
//! its most recently created edge, after which ordering runs again.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use cirrus_core::domain::{
    ChangeId, ChangeKind, ChangeState, FailureReason, FailureSet, FileChange, RelativePath,
};
use tracing::{debug, instrument, warn};

/// Output of one resolution pass
#[derive(Debug, Default)]
pub struct Resolution {
    /// Changes to merge and push, in execution order
    pub ready: Vec<FileChange>,
    /// Changes held back, with the reason
    pub blocked: Vec<(FileChange, FailureReason)>,
    /// Malformed changes
    pub rejected: Vec<(FileChange, FailureReason)>,
    /// Ids dropped by coalescing
    pub coalesced: Vec<ChangeId>,
    dependencies: HashMap<ChangeId, Vec<ChangeId>>,
}

impl Resolution {
    /// Ready changes that must land before `id`
    pub fn blockers_of(&self, id: ChangeId) -> &[ChangeId] {
        self.dependencies.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Returns true if the pass produced nothing at all
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
            && self.blocked.is_empty()
            && self.rejected.is_empty()
            && self.coalesced.is_empty()
    }
}

/// Converts candidate changes into a dependency-respecting plan
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolves `candidates` against the changes still in `failures`
    #[instrument(skip_all, fields(candidates = candidates.len(), waiting = failures.len()))]
    pub fn resolve(&self, candidates: Vec<FileChange>, failures: &FailureSet) -> Resolution {
        let mut rejected = Vec::new();
        let mut nodes = BTreeMap::new();

        for change in candidates {
            let Some(id) = change.id() else {
                warn!(change = %change, "Rejecting change without id");
                rejected.push((change, FailureReason::Invalid("change has no id".into())));
                continue;
            };
            if let Err(e) = change.validate() {
                warn!(change_id = %id, error = %e, "Rejecting malformed change");
                rejected.push((change, FailureReason::Invalid(e.to_string())));
                continue;
            }
            if nodes.insert(id, change).is_some() {
                debug!(change_id = %id, "Duplicate id in batch, keeping the latest copy");
            }
        }

        let mut unavailable: BTreeMap<ChangeId, FileChange> = failures
            .iter()
            .filter_map(|entry| {
                let id = entry.change.id()?;
                (!nodes.contains_key(&id)).then(|| (id, entry.change.clone()))
            })
            .collect();
        for (change, _) in &rejected {
            if let Some(id) = change.id() {
                unavailable.entry(id).or_insert_with(|| change.clone());
            }
        }

        let mut graph = DependencyGraph::new(nodes, unavailable);
        graph.derive_edges();
        let coalesced = graph.coalesce();
        let ordering = graph.order();

        debug!(
            ready = ordering.ready.len(),
            blocked = ordering.blocked.len(),
            rejected = rejected.len(),
            coalesced = coalesced.len(),
            "Resolved change batch"
        );

        Resolution {
            ready: ordering.ready,
            blocked: ordering.blocked,
            rejected,
            coalesced,
            dependencies: ordering.dependencies,
        }
    }
}

// ============================================================================
// Dependency graph
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    blocker: ChangeId,
    dependent: ChangeId,
    seq: u64,
}

/// What coalescing two consecutive changes on one path produced
enum Coalesce {
    /// The later change was folded into the earlier one
    KeepFirst,
    /// The earlier change was superseded by the later one
    KeepSecond,
    /// Both vanish, together with the listed nested changes
    Annihilate(Vec<ChangeId>),
    /// The pair stays as is
    Keep,
}

struct Ordering {
    ready: Vec<FileChange>,
    blocked: Vec<(FileChange, FailureReason)>,
    dependencies: HashMap<ChangeId, Vec<ChangeId>>,
}

struct DependencyGraph {
    /// Candidates, keyed by id
    nodes: BTreeMap<ChangeId, FileChange>,
    /// Pending changes that can never be ready in this pass
    unavailable: BTreeMap<ChangeId, FileChange>,
    edges: Vec<Edge>,
    next_seq: u64,
}

impl DependencyGraph {
    fn new(nodes: BTreeMap<ChangeId, FileChange>, unavailable: BTreeMap<ChangeId, FileChange>) -> Self {
        Self {
            nodes,
            unavailable,
            edges: Vec::new(),
            next_seq: 0,
        }
    }

    fn add_edge(&mut self, blocker: ChangeId, dependent: ChangeId) {
        if blocker == dependent
            || self
                .edges
                .iter()
                .any(|e| e.blocker == blocker && e.dependent == dependent)
        {
            return;
        }
        self.edges.push(Edge {
            blocker,
            dependent,
            seq: self.next_seq,
        });
        self.next_seq += 1;
    }

    fn blockers(&self, id: ChangeId) -> impl Iterator<Item = ChangeId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.dependent == id)
            .map(|e| e.blocker)
    }

    fn remove_node(&mut self, id: ChangeId) -> Option<FileChange> {
        self.edges.retain(|e| e.blocker != id && e.dependent != id);
        self.nodes.remove(&id)
    }

    /// Moves every edge of `from` onto `to`
    fn redirect(&mut self, from: ChangeId, to: ChangeId) {
        let moved: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| e.blocker == from || e.dependent == from)
            .copied()
            .collect();
        self.edges.retain(|e| e.blocker != from && e.dependent != from);
        for edge in moved {
            let blocker = if edge.blocker == from { to } else { edge.blocker };
            let dependent = if edge.dependent == from { to } else { edge.dependent };
            self.add_edge(blocker, dependent);
        }
    }

    // ------------------------------------------------------------------------
    // Edge derivation
    // ------------------------------------------------------------------------

    fn derive_edges(&mut self) {
        let all: Vec<(ChangeId, FileChange)> = {
            let mut all: Vec<(ChangeId, FileChange)> = self
                .nodes
                .iter()
                .chain(self.unavailable.iter())
                .map(|(id, c)| (*id, c.clone()))
                .collect();
            all.sort_by_key(|(id, _)| *id);
            all
        };

        let mut derived = Vec::new();
        for (i, (dependent, b)) in all.iter().enumerate() {
            if !self.nodes.contains_key(dependent) {
                continue;
            }
            let mut same_path_prior = None;

            for (blocker, a) in &all[..i] {
                if a.kind() == ChangeKind::Created
                    && a.is_folder()
                    && a.path().is_ancestor_of(b.path())
                {
                    derived.push((*blocker, *dependent));
                }

                if a.touched_paths().any(|p| p == b.path()) {
                    same_path_prior = Some(*blocker);
                }

                if let (ChangeKind::Renamed, Some(source)) = (b.kind(), b.from_path()) {
                    if a.touched_paths().any(|p| p.is_within(source)) {
                        derived.push((*blocker, *dependent));
                    }
                }

                if b.kind() == ChangeKind::Deleted
                    && a.touched_paths().any(|p| b.path().is_ancestor_of(p))
                {
                    derived.push((*blocker, *dependent));
                }
            }

            if let Some(blocker) = same_path_prior {
                derived.push((blocker, *dependent));
            }
        }

        for (blocker, dependent) in derived {
            self.add_edge(blocker, dependent);
        }
    }

    // ------------------------------------------------------------------------
    // Coalescing
    // ------------------------------------------------------------------------

    /// Collapses consecutive changes on the same path; returns dropped ids
    fn coalesce(&mut self) -> Vec<ChangeId> {
        let mut by_path: BTreeMap<RelativePath, Vec<ChangeId>> = BTreeMap::new();
        for (id, change) in &self.nodes {
            by_path.entry(change.path().clone()).or_default().push(*id);
        }

        let mut dropped = Vec::new();
        // Ancestors sort before their descendants, so folder-level
        // annihilation runs before the nested paths are visited.
        for (path, ids) in by_path {
            let mut survivor: Option<ChangeId> = None;
            for id in ids {
                if !self.nodes.contains_key(&id) {
                    continue;
                }
                let Some(prev) = survivor.filter(|prev| self.nodes.contains_key(prev)) else {
                    survivor = Some(id);
                    continue;
                };
                match self.coalesce_pair(prev, id, &path) {
                    Coalesce::KeepFirst => {
                        debug!(kept = %prev, dropped = %id, path = %path, "Coalesced change");
                        self.redirect(id, prev);
                        self.nodes.remove(&id);
                        dropped.push(id);
                    }
                    Coalesce::KeepSecond => {
                        debug!(kept = %id, dropped = %prev, path = %path, "Coalesced change");
                        self.redirect(prev, id);
                        self.nodes.remove(&prev);
                        dropped.push(prev);
                        survivor = Some(id);
                    }
                    Coalesce::Annihilate(nested) => {
                        debug!(
                            created = %prev,
                            deleted = %id,
                            nested = nested.len(),
                            path = %path,
                            "Created and deleted within one batch"
                        );
                        for gone in std::iter::once(prev).chain(std::iter::once(id)).chain(nested) {
                            if self.remove_node(gone).is_some() {
                                dropped.push(gone);
                            }
                        }
                        survivor = None;
                    }
                    Coalesce::Keep => survivor = Some(id),
                }
            }
        }

        dropped.sort();
        dropped
    }

    fn coalesce_pair(&mut self, prev: ChangeId, next: ChangeId, path: &RelativePath) -> Coalesce {
        let (Some(a), Some(b)) = (self.nodes.get(&prev), self.nodes.get(&next)) else {
            return Coalesce::Keep;
        };
        // A change that came back from the failure set may already be in the
        // index under its own id.
        if a.state() != ChangeState::Queued || b.state() != ChangeState::Queued {
            return Coalesce::Keep;
        }
        if self.touched_between(prev, next, path) {
            return Coalesce::Keep;
        }

        match (a.kind(), b.kind()) {
            (ChangeKind::Created, ChangeKind::Deleted) => match self.nested_between(prev, next, path) {
                Some(nested) => Coalesce::Annihilate(nested),
                None => Coalesce::Keep,
            },
            (ChangeKind::Created, ChangeKind::Modified) => {
                let metadata = b.metadata().clone();
                if let Some(created) = self.nodes.get_mut(&prev) {
                    created.set_metadata(metadata);
                }
                Coalesce::KeepFirst
            }
            (ChangeKind::Modified, ChangeKind::Modified) => Coalesce::KeepSecond,
            (ka, kb)
                if ka == kb && a.from_path() == b.from_path() && a.metadata() == b.metadata() =>
            {
                Coalesce::KeepFirst
            }
            _ => Coalesce::Keep,
        }
    }

    /// Returns true if any pending change strictly between the two ids
    /// touches `path` itself or moves or deletes one of its ancestors
    fn touched_between(&self, prev: ChangeId, next: ChangeId, path: &RelativePath) -> bool {
        self.nodes
            .range(prev..next)
            .chain(self.unavailable.range(prev..next))
            .filter(|(id, _)| **id != prev)
            .any(|(_, c)| {
                c.touched_paths().any(|p| {
                    p == path
                        || (p.is_ancestor_of(path)
                            && matches!(c.kind(), ChangeKind::Renamed | ChangeKind::Deleted))
                })
            })
    }

    /// Changes strictly between the ids that live entirely under `path`
    ///
    /// Returns `None` if one of them cannot vanish with the folder: it
    /// reaches outside `path`, has been in the failure set, or is waiting
    /// there now.
    fn nested_between(
        &self,
        prev: ChangeId,
        next: ChangeId,
        path: &RelativePath,
    ) -> Option<Vec<ChangeId>> {
        let inside = |c: &FileChange| c.touched_paths().any(|p| path.is_ancestor_of(p));
        let fully_inside = |c: &FileChange| c.touched_paths().all(|p| path.is_ancestor_of(p));

        if self
            .unavailable
            .range(prev..next)
            .any(|(_, c)| inside(c))
        {
            return None;
        }

        let mut nested = Vec::new();
        for (id, c) in self.nodes.range(prev..next) {
            if *id == prev || !inside(c) {
                continue;
            }
            if !fully_inside(c) || c.state() != ChangeState::Queued {
                return None;
            }
            nested.push(*id);
        }
        Some(nested)
    }

    // ------------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------------

    fn order(mut self) -> Ordering {
        let mut demoted: BTreeSet<ChangeId> = BTreeSet::new();

        let (ready_ids, blocked_ids) = loop {
            match self.try_order(&demoted) {
                Ok(result) => break result,
                Err(stuck) => {
                    let victim = self.cycle_victim(&stuck);
                    warn!(change_id = %victim, "Breaking dependency cycle");
                    demoted.insert(victim);
                    self.edges
                        .retain(|e| e.blocker != victim && e.dependent != victim);
                }
            }
        };

        let ready_set: HashSet<ChangeId> = ready_ids.iter().copied().collect();
        let mut dependencies = HashMap::new();
        for id in &ready_ids {
            let mut blockers: Vec<ChangeId> = self
                .blockers(*id)
                .filter(|b| ready_set.contains(b))
                .collect();
            blockers.sort();
            if !blockers.is_empty() {
                dependencies.insert(*id, blockers);
            }
        }

        let ready = ready_ids
            .into_iter()
            .filter_map(|id| self.nodes.remove(&id))
            .collect();

        let mut blocked = Vec::new();
        for (id, blockers) in blocked_ids {
            if let Some(change) = self.nodes.remove(&id) {
                debug!(change_id = %id, ?blockers, "Change blocked on dependency");
                blocked.push((change, FailureReason::BlockedOnDependency(blockers)));
            }
        }
        for id in demoted {
            if let Some(change) = self.nodes.remove(&id) {
                blocked.push((change, FailureReason::DependencyCycle));
            }
        }
        blocked.sort_by_key(|(c, _)| c.id());

        Ordering {
            ready,
            blocked,
            dependencies,
        }
    }

    /// Kahn's algorithm with lowest-id tie breaking
    ///
    /// Returns the ready ids in order and the blocked ids with the blockers
    /// that held them, or the ids left stuck on a cycle.
    #[allow(clippy::type_complexity)]
    fn try_order(
        &self,
        demoted: &BTreeSet<ChangeId>,
    ) -> Result<(Vec<ChangeId>, BTreeMap<ChangeId, Vec<ChangeId>>), Vec<ChangeId>> {
        let mut pending: BTreeSet<ChangeId> = self
            .nodes
            .keys()
            .filter(|id| !demoted.contains(id))
            .copied()
            .collect();
        let mut ready = Vec::new();
        let mut ready_set: HashSet<ChangeId> = HashSet::new();
        let mut ready_paths: HashMap<&RelativePath, ChangeId> = HashMap::new();
        let mut blocked: BTreeMap<ChangeId, Vec<ChangeId>> = BTreeMap::new();

        loop {
            let mut progressed = false;

            let newly_blocked: Vec<(ChangeId, Vec<ChangeId>)> = pending
                .iter()
                .filter_map(|id| {
                    let mut stuck: Vec<ChangeId> = self
                        .blockers(*id)
                        .filter(|b| {
                            self.unavailable.contains_key(b)
                                || blocked.contains_key(b)
                                || demoted.contains(b)
                        })
                        .collect();
                    stuck.sort();
                    (!stuck.is_empty()).then_some((*id, stuck))
                })
                .collect();
            for (id, stuck) in newly_blocked {
                pending.remove(&id);
                blocked.insert(id, stuck);
                progressed = true;
            }

            let next = pending
                .iter()
                .copied()
                .find(|id| self.blockers(*id).all(|b| ready_set.contains(&b)));

            if let Some(id) = next {
                pending.remove(&id);
                let Some(change) = self.nodes.get(&id) else {
                    continue;
                };
                match ready_paths.get(change.path()) {
                    Some(holder) => {
                        blocked.insert(id, vec![*holder]);
                    }
                    None => {
                        ready_paths.insert(change.path(), id);
                        ready_set.insert(id);
                        ready.push(id);
                    }
                }
                continue;
            }

            if pending.is_empty() {
                return Ok((ready, blocked));
            }
            if !progressed {
                return Err(pending.into_iter().collect());
            }
        }
    }

    /// Picks the change to demote from the cycle running through `stuck`
    fn cycle_victim(&self, stuck: &[ChangeId]) -> ChangeId {
        let stuck_set: HashSet<ChangeId> = stuck.iter().copied().collect();
        let Some(&start) = stuck.first() else {
            return ChangeId::new(0);
        };

        // Walk from dependent to a stuck blocker until a node repeats.
        let mut walk = vec![start];
        let mut position: HashMap<ChangeId, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        let cycle_start = loop {
            let Some(blocker) = self.blockers(current).filter(|b| stuck_set.contains(b)).min()
            else {
                return current;
            };
            if let Some(&pos) = position.get(&blocker) {
                break pos;
            }
            position.insert(blocker, walk.len());
            walk.push(blocker);
            current = blocker;
        };

        let cycle = &walk[cycle_start..];
        let mut newest: Option<Edge> = None;
        for (i, dependent) in cycle.iter().enumerate() {
            let blocker = cycle[(i + 1) % cycle.len()];
            if let Some(edge) = self
                .edges
                .iter()
                .find(|e| e.blocker == blocker && e.dependent == *dependent)
            {
                if newest.map_or(true, |n| edge.seq > n.seq) {
                    newest = Some(*edge);
                }
            }
        }
        newest.map_or(cycle[0], |edge| edge.dependent)
    }

    #[cfg(test)]
    fn has_edge(&self, blocker: u64, dependent: u64) -> bool {
        self.edges.iter().any(|e| {
            e.blocker == ChangeId::new(blocker) && e.dependent == ChangeId::new(dependent)
        })
    }
}
