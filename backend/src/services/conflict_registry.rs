//! In-memory registry of detected conflicts.
//!
//! Conflicts get a process-local id when detected so that callers can ask
//! for remediation options and apply one later.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::models::{Conflict, ConflictId, ConflictingSchedule, ResolutionOption, ScheduleCandidate, ScheduleId};

pub struct ConflictRegistry {
    conflicts: RwLock<BTreeMap<ConflictId, Conflict>>,
    next_id: AtomicI64,
}

impl Default for ConflictRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self {
            conflicts: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Register a conflict, or refresh the open one already tracking the
    /// same subject. A committed subject is matched by record id, a pending
    /// one by its whole assignment. Returns the conflict and whether it is new.
    pub fn register(&self, candidate: ScheduleCandidate, overlaps: &[ConflictingSchedule]) -> (Conflict, bool) {
        let mut conflicts = self.conflicts.write();
        if let Some(existing) = conflicts
            .values_mut()
            .find(|c| !c.is_resolved() && same_subject(&c.candidate, &candidate))
        {
            let refreshed = Conflict::new(existing.id, candidate, overlaps);
            existing.candidate = refreshed.candidate;
            existing.conflicting = refreshed.conflicting;
            existing.kinds = refreshed.kinds;
            return (existing.clone(), false);
        }
        let id = ConflictId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conflict = Conflict::new(id, candidate, overlaps);
        conflicts.insert(id, conflict.clone());
        (conflict, true)
    }

    pub fn get(&self, id: ConflictId) -> Option<Conflict> {
        self.conflicts.read().get(&id).cloned()
    }

    /// Unresolved conflicts, oldest first.
    pub fn open(&self) -> Vec<Conflict> {
        self.conflicts
            .read()
            .values()
            .filter(|c| !c.is_resolved())
            .cloned()
            .collect()
    }

    pub fn open_involving(&self, schedule_id: ScheduleId) -> Vec<Conflict> {
        self.conflicts
            .read()
            .values()
            .filter(|c| !c.is_resolved() && c.involves(schedule_id))
            .cloned()
            .collect()
    }

    /// Record the applied option. Returns `None` if the conflict is unknown
    /// or was already resolved.
    pub fn mark_resolved(&self, id: ConflictId, option: ResolutionOption) -> Option<Conflict> {
        let mut conflicts = self.conflicts.write();
        let conflict = conflicts.get_mut(&id)?;
        if conflict.is_resolved() {
            return None;
        }
        conflict.resolved_at = Some(Utc::now());
        conflict.resolution = Some(option);
        Some(conflict.clone())
    }

    /// Close a conflict that no longer holds, without an applied option.
    pub fn dismiss(&self, id: ConflictId) -> Option<Conflict> {
        let mut conflicts = self.conflicts.write();
        let conflict = conflicts.get_mut(&id)?;
        if conflict.is_resolved() {
            return None;
        }
        conflict.resolved_at = Some(Utc::now());
        Some(conflict.clone())
    }

    pub fn len(&self) -> usize {
        self.conflicts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same_subject(tracked: &ScheduleCandidate, candidate: &ScheduleCandidate) -> bool {
    match (tracked.id, candidate.id) {
        (Some(a), Some(b)) => a == b,
        (None, None) => tracked == candidate,
        _ => false,
    }
}
