//! Applies a chosen resolution option atomically.
//!
//! The option is re-validated under the resource keys it touches, committed
//! as a single batch, and verified once more after the commit. If the
//! committed state still conflicts, a compensating batch restores the
//! previous records and the caller gets [`StaleOptionError`].

use chrono::Utc;
use std::sync::Arc;

use super::calendar::ResourceCalendar;
use super::conflict_detector::ConflictDetector;
use super::conflict_registry::ConflictRegistry;
use super::error::{DispatchError, DispatchResult, StaleOptionError};
use super::locks::{KeyGuard, LockKey};
use super::resolution_planner::swapped;
use crate::db::{BatchOutcome, CalendarBatch, RepositoryError};
use crate::models::{
    Conflict, ConflictId, DriverId, ResolutionAction, ResolutionOption, ResolutionRecord, Schedule,
    ScheduleCandidate, ScheduleId, SchedulePatch, ScheduleStatus,
};

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResolution {
    pub conflict: Conflict,
    /// Every record written, in their new state.
    pub schedules: Vec<Schedule>,
    /// Drivers that were assigned to the affected trips before the change.
    pub previous_drivers: Vec<DriverId>,
}

impl AppliedResolution {
    pub fn schedule_ids(&self) -> Vec<ScheduleId> {
        self.schedules.iter().map(|s| s.id).collect()
    }

    /// Everyone who should hear about the change.
    pub fn affected_drivers(&self) -> Vec<DriverId> {
        let mut drivers: Vec<DriverId> = self
            .schedules
            .iter()
            .map(|s| s.driver_id)
            .chain(self.previous_drivers.iter().copied())
            .collect();
        drivers.sort();
        drivers.dedup();
        drivers
    }
}

/// Writes an option resolves to, plus what is needed to check them.
struct Plan {
    batch: CalendarBatch,
    /// Assignments that must be free of overlaps after the commit.
    expected: Vec<ScheduleCandidate>,
    keys: Vec<LockKey>,
    previous_drivers: Vec<DriverId>,
}

pub struct ResolutionExecutor {
    calendar: Arc<ResourceCalendar>,
    detector: Arc<ConflictDetector>,
    registry: Arc<ConflictRegistry>,
}

impl ResolutionExecutor {
    pub fn new(
        calendar: Arc<ResourceCalendar>,
        detector: Arc<ConflictDetector>,
        registry: Arc<ConflictRegistry>,
    ) -> Self {
        Self {
            calendar,
            detector,
            registry,
        }
    }

    pub async fn apply(
        &self,
        conflict_id: ConflictId,
        option: &ResolutionOption,
    ) -> DispatchResult<AppliedResolution> {
        let conflict = self.open_conflict(conflict_id)?;

        // Learn which keys the option touches, then take them and
        // re-read everything under the lock.
        let plan = self.plan(&conflict, option).await?;
        let guard = self.calendar.lock(plan.keys.clone()).await;

        let conflict = self.open_conflict(conflict_id)?;
        let locked_plan = self.plan(&conflict, option).await?;
        if locked_plan.keys != plan.keys {
            return Err(StaleOptionError::new(conflict_id, "schedules changed since the option was generated").into());
        }

        for expected in &locked_plan.expected {
            let exclude = exclusions(&locked_plan.expected);
            let overlaps = self.detector.detect_excluding(expected, &exclude).await?;
            if !overlaps.is_empty() {
                let ids = overlaps.iter().map(|o| o.schedule.id).collect();
                return Err(StaleOptionError::new(conflict_id, "option now overlaps other schedules")
                    .with_conflicting(ids)
                    .into());
            }
        }
        if let [a, b] = locked_plan.expected.as_slice() {
            if self.detector.collides(a, b) || self.detector.collides(b, a) {
                return Err(StaleOptionError::new(conflict_id, "swapped trips would overlap each other").into());
            }
        }

        let outcome = self
            .calendar
            .commit(&guard, locked_plan.batch)
            .await
            .map_err(execution_error)?;

        self.verify_or_compensate(conflict_id, &guard, &outcome).await?;

        let resolved = match self.registry.mark_resolved(conflict_id, option.clone()) {
            Some(resolved) => resolved,
            None => {
                log::warn!("Conflict {} was resolved concurrently", conflict_id);
                conflict.clone()
            }
        };
        drop(guard);

        let schedules: Vec<Schedule> = outcome
            .inserted
            .iter()
            .chain(outcome.updated.iter())
            .cloned()
            .collect();
        self.refresh_primary_flags(&conflict).await;
        self.audit(&resolved, option, &schedules).await;

        log::info!(
            "Applied {} to conflict {} ({} schedule(s) written)",
            option.kind().as_str(),
            conflict_id,
            schedules.len()
        );
        Ok(AppliedResolution {
            conflict: resolved,
            schedules,
            previous_drivers: locked_plan.previous_drivers,
        })
    }

    fn open_conflict(&self, conflict_id: ConflictId) -> DispatchResult<Conflict> {
        let conflict = self
            .registry
            .get(conflict_id)
            .ok_or(DispatchError::ConflictNotFound(conflict_id))?;
        if conflict.is_resolved() {
            return Err(StaleOptionError::new(conflict_id, "conflict already resolved").into());
        }
        Ok(conflict)
    }

    /// Current subject assignment. A committed subject that vanished or left
    /// the scheduled state makes every option stale.
    async fn subject(&self, conflict: &Conflict) -> DispatchResult<(ScheduleCandidate, Option<Schedule>)> {
        let Some(id) = conflict.candidate.id else {
            return Ok((conflict.candidate.clone(), None));
        };
        let record = self.fetch(conflict.id, id).await?;
        if record.status != ScheduleStatus::Scheduled {
            return Err(StaleOptionError::new(
                conflict.id,
                format!("schedule {} is {}", id, record.status),
            )
            .into());
        }
        Ok((record.to_candidate(), Some(record)))
    }

    async fn fetch(&self, conflict_id: ConflictId, id: ScheduleId) -> DispatchResult<Schedule> {
        match self.calendar.get(id).await {
            Ok(schedule) => Ok(schedule),
            Err(e) if e.is_not_found() => {
                Err(StaleOptionError::new(conflict_id, format!("schedule {} no longer exists", id)).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_available(&self, conflict_id: ConflictId, driver_id: DriverId) -> DispatchResult<()> {
        match self.calendar.repository().get_driver(driver_id).await {
            Ok(driver) if driver.is_available() => Ok(()),
            Ok(driver) => Err(StaleOptionError::new(
                conflict_id,
                format!("driver {} is not available ({:?})", driver_id, driver.status),
            )
            .into()),
            Err(e) if e.is_not_found() => {
                Err(StaleOptionError::new(conflict_id, format!("driver {} not found", driver_id)).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn plan(&self, conflict: &Conflict, option: &ResolutionOption) -> DispatchResult<Plan> {
        let (subject, record) = self.subject(conflict).await?;
        let mut keys: Vec<LockKey> = LockKey::for_candidate(&subject).into();
        let mut previous_drivers = vec![subject.driver_id];

        let (batch, expected) = match &option.action {
            ResolutionAction::ReassignDriver { driver_id } => {
                if *driver_id == subject.driver_id {
                    return Err(StaleOptionError::new(conflict.id, "driver already assigned").into());
                }
                self.ensure_available(conflict.id, *driver_id).await?;
                let patch = SchedulePatch::reassign_driver(*driver_id);
                let after = subject.with_patch(&patch);
                keys.extend(LockKey::for_candidate(&after));
                (single_write(&subject, record.as_ref(), &after, patch), vec![after])
            }
            ResolutionAction::Reschedule { departure, .. } => {
                // The arrival is recomputed from the route as it is now.
                let arrival = *departure + self.calendar.trip_duration(&subject).await?;
                if departure.date() != subject.service_date || arrival.date() != subject.service_date {
                    return Err(StaleOptionError::new(conflict.id, "new slot leaves the service date").into());
                }
                let patch = SchedulePatch::retime(*departure, arrival);
                let after = subject.with_patch(&patch);
                (single_write(&subject, record.as_ref(), &after, patch), vec![after])
            }
            ResolutionAction::Swap { target_schedule_id } => {
                let target = self.fetch(conflict.id, *target_schedule_id).await?;
                if target.status != ScheduleStatus::Scheduled
                    || target.service_date != subject.service_date
                    || conflict.involves(target.id)
                {
                    return Err(StaleOptionError::new(
                        conflict.id,
                        format!("schedule {} can no longer be swapped", target.id),
                    )
                    .into());
                }
                keys.extend(LockKey::for_schedule(&target));
                previous_drivers.push(target.driver_id);

                let (subject_after, target_after) = swapped(&subject, &target);
                let target_patch = SchedulePatch::assignment(subject.driver_id, subject.vehicle_id.clone())
                    .with_conflict_flag(false);
                let mut batch = CalendarBatch::default();
                batch = match record {
                    Some(ref record) => batch.update(
                        record.id,
                        SchedulePatch::assignment(target.driver_id, target.vehicle_id.clone())
                            .with_conflict_flag(false),
                    ),
                    None => batch.insert(subject_after.clone()),
                };
                batch = batch.update(target.id, target_patch);
                (batch, vec![subject_after, target_after])
            }
        };

        keys.sort();
        keys.dedup();
        Ok(Plan {
            batch,
            expected,
            keys,
            previous_drivers,
        })
    }

    async fn verify_or_compensate(
        &self,
        conflict_id: ConflictId,
        guard: &KeyGuard,
        outcome: &BatchOutcome,
    ) -> DispatchResult<()> {
        let mut offending = Vec::new();
        for schedule in outcome.inserted.iter().chain(outcome.updated.iter()) {
            let overlaps = self.detector.detect(&schedule.to_candidate()).await?;
            offending.extend(overlaps.into_iter().map(|o| o.schedule.id));
        }
        if offending.is_empty() {
            return Ok(());
        }
        offending.sort();
        offending.dedup();

        log::warn!(
            "Resolution of conflict {} left overlaps with {:?}, reverting",
            conflict_id,
            offending
        );
        let mut undo = CalendarBatch::default();
        for schedule in &outcome.inserted {
            undo = undo.delete(schedule.id);
        }
        for before in &outcome.previous {
            undo = undo.update(before.id, before.snapshot_patch());
        }
        self.calendar.commit(guard, undo).await.map_err(execution_error)?;

        Err(StaleOptionError::new(conflict_id, "calendar changed while applying the option")
            .with_conflicting(offending)
            .into())
    }

    /// Primaries keep their marker only while another open conflict still
    /// involves them.
    async fn refresh_primary_flags(&self, conflict: &Conflict) {
        let flags: Vec<(ScheduleId, bool)> = conflict
            .conflicting
            .iter()
            .map(|id| (*id, !self.registry.open_involving(*id).is_empty()))
            .collect();
        if let Err(e) = self.calendar.mark_conflicts(&flags).await {
            log::warn!("Failed to refresh conflict flags for conflict {}: {}", conflict.id, e);
        }
    }

    async fn audit(&self, conflict: &Conflict, option: &ResolutionOption, schedules: &[Schedule]) {
        let record = ResolutionRecord {
            conflict_id: conflict.id,
            option: option.clone(),
            affected: schedules.iter().map(|s| s.id).collect(),
            applied_at: Utc::now(),
        };
        if let Err(e) = self.calendar.repository().record_resolution(record).await {
            log::warn!("Failed to record resolution of conflict {}: {}", conflict.id, e);
        }
    }
}

/// A pending subject is inserted with its new assignment; a committed one
/// is patched in place.
fn single_write(
    subject: &ScheduleCandidate,
    record: Option<&Schedule>,
    after: &ScheduleCandidate,
    patch: SchedulePatch,
) -> CalendarBatch {
    match record {
        Some(record) => CalendarBatch::default().update(record.id, patch.with_conflict_flag(false)),
        None => {
            debug_assert!(subject.id.is_none());
            CalendarBatch::default().insert(after.clone())
        }
    }
}

fn exclusions(expected: &[ScheduleCandidate]) -> Vec<ScheduleId> {
    expected.iter().filter_map(|c| c.id).collect()
}

fn execution_error(err: RepositoryError) -> DispatchError {
    match err {
        RepositoryError::TransactionError { .. } => DispatchError::ExecutionFailed(err),
        other => DispatchError::Repository(other),
    }
}
