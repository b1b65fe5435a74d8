//! Resource calendar: the service-side view over the schedule store.
//!
//! Reads go straight to the repository. Writes must present a [`KeyGuard`]
//! so that they only happen while the resources they touch are serialized,
//! and every successful write bumps a revision counter that downstream
//! caches key on.

use chrono::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::locks::{KeyGuard, KeyLocks, LockKey};
use crate::db::{BatchOutcome, CalendarBatch, FullRepository, RepositoryError, RepositoryResult};
use crate::models::{
    OverlapQuery, Schedule, ScheduleCandidate, ScheduleFilter, ScheduleId, SchedulePatch,
};

pub struct ResourceCalendar {
    repo: Arc<dyn FullRepository>,
    locks: KeyLocks,
    revision: AtomicU64,
}

impl ResourceCalendar {
    pub fn new(repo: Arc<dyn FullRepository>) -> Self {
        Self {
            repo,
            locks: KeyLocks::new(),
            revision: AtomicU64::new(0),
        }
    }

    pub fn repository(&self) -> &Arc<dyn FullRepository> {
        &self.repo
    }

    /// Incremented by every committed write.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Serialize on `keys` until the returned guard is dropped.
    pub async fn lock(&self, keys: impl IntoIterator<Item = LockKey>) -> KeyGuard {
        self.locks.acquire(keys).await
    }

    pub async fn get(&self, schedule_id: ScheduleId) -> RepositoryResult<Schedule> {
        self.repo.get_schedule(schedule_id).await
    }

    pub async fn list(&self, filter: &ScheduleFilter) -> RepositoryResult<Vec<Schedule>> {
        self.repo.list_schedules(filter).await
    }

    pub async fn find_overlapping(&self, query: &OverlapQuery) -> RepositoryResult<Vec<Schedule>> {
        self.repo.find_overlapping(query).await
    }

    /// Store a new record. The caller must already have checked it for
    /// overlaps while holding `guard`.
    pub async fn insert(
        &self,
        guard: &KeyGuard,
        candidate: ScheduleCandidate,
    ) -> RepositoryResult<Schedule> {
        Self::ensure_covered(guard, &LockKey::for_candidate(&candidate))?;
        let schedule = self.repo.insert_schedule(candidate).await?;
        self.bump();
        Ok(schedule)
    }

    /// Patch several records, all-or-nothing. `guard` must cover the keys of
    /// every record both before and after its patch.
    pub async fn update_many(
        &self,
        guard: &KeyGuard,
        updates: Vec<(ScheduleId, SchedulePatch)>,
    ) -> RepositoryResult<Vec<Schedule>> {
        self.ensure_updates_covered(guard, &updates).await?;
        let updated = self.repo.update_many(updates).await?;
        self.bump();
        Ok(updated)
    }

    /// Commit an atomic batch.
    pub async fn commit(&self, guard: &KeyGuard, batch: CalendarBatch) -> RepositoryResult<BatchOutcome> {
        for candidate in &batch.inserts {
            Self::ensure_covered(guard, &LockKey::for_candidate(candidate))?;
        }
        self.ensure_updates_covered(guard, &batch.updates).await?;
        for id in &batch.deletes {
            match self.repo.get_schedule(*id).await {
                Ok(current) => Self::ensure_covered(guard, &LockKey::for_schedule(&current))?,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let outcome = self.repo.apply_batch(batch).await?;
        self.bump();
        Ok(outcome)
    }

    /// Set the derived conflict marker on a set of records.
    ///
    /// The marker never feeds back into detection, so this does not need the
    /// resource keys. Records that disappeared in the meantime are skipped.
    pub async fn mark_conflicts(&self, flags: &[(ScheduleId, bool)]) -> RepositoryResult<()> {
        for (id, flag) in flags {
            match self
                .repo
                .update_many(vec![(*id, SchedulePatch::conflict_flag(*flag))])
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    log::debug!("Schedule {} vanished before its conflict flag was set", id);
                }
                Err(e) => return Err(e),
            }
        }
        if !flags.is_empty() {
            self.bump();
        }
        Ok(())
    }

    /// Planned running time for `candidate`: its route's duration, or the
    /// candidate's own window when the route is unknown.
    pub async fn trip_duration(&self, candidate: &ScheduleCandidate) -> RepositoryResult<Duration> {
        match self.repo.get_route(candidate.route_id).await {
            Ok(route) if route.duration_minutes > 0 => Ok(route.duration()),
            Ok(_) => Ok(candidate.window().duration()),
            Err(e) if e.is_not_found() => Ok(candidate.window().duration()),
            Err(e) => Err(e),
        }
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    async fn ensure_updates_covered(
        &self,
        guard: &KeyGuard,
        updates: &[(ScheduleId, SchedulePatch)],
    ) -> RepositoryResult<()> {
        for (id, patch) in updates {
            let current = self.repo.get_schedule(*id).await?;
            Self::ensure_covered(guard, &LockKey::for_schedule(&current))?;
            let next = current.to_candidate().with_patch(patch);
            Self::ensure_covered(guard, &LockKey::for_candidate(&next))?;
        }
        Ok(())
    }

    fn ensure_covered(guard: &KeyGuard, keys: &[LockKey]) -> RepositoryResult<()> {
        match keys.iter().find(|key| !guard.covers(key)) {
            Some(key) => Err(RepositoryError::internal(format!(
                "write to {} attempted without holding its key",
                key
            ))),
            None => Ok(()),
        }
    }
}
