//! Overlap detection between a candidate and the committed calendar.
//!
//! Detection is a pure read: running it twice against an unchanged calendar
//! yields the same result and it never writes.

use chrono::{Duration, NaiveDate};
use std::sync::Arc;

use super::calendar::ResourceCalendar;
use crate::db::RepositoryResult;
use crate::models::{
    ConflictingSchedule, OverlapKind, OverlapQuery, Schedule, ScheduleCandidate, ScheduleFilter,
    ScheduleId, ScheduleStatus,
};

/// A committed schedule found to collide with earlier-created records.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedConflict {
    /// The later-created side, which remediation targets.
    pub subject: Schedule,
    /// Earlier-created records it collides with.
    pub primaries: Vec<ConflictingSchedule>,
}

pub struct ConflictDetector {
    calendar: Arc<ResourceCalendar>,
    buffer: Duration,
}

impl ConflictDetector {
    pub fn new(calendar: Arc<ResourceCalendar>, buffer: Duration) -> Self {
        Self { calendar, buffer }
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// Committed active schedules overlapping `candidate`, with the shared
    /// resources of each.
    pub async fn detect(&self, candidate: &ScheduleCandidate) -> RepositoryResult<Vec<ConflictingSchedule>> {
        self.detect_excluding(candidate, &[]).await
    }

    /// Like [`detect`](Self::detect), ignoring `exclude` as well as the
    /// candidate's own record.
    pub async fn detect_excluding(
        &self,
        candidate: &ScheduleCandidate,
        exclude: &[ScheduleId],
    ) -> RepositoryResult<Vec<ConflictingSchedule>> {
        let query = OverlapQuery::for_candidate(candidate, self.buffer).excluding(exclude.iter().copied());
        let found = self.calendar.find_overlapping(&query).await?;
        Ok(found
            .into_iter()
            .map(|schedule| ConflictingSchedule {
                kinds: classify(candidate, &schedule),
                schedule,
            })
            .collect())
    }

    /// Whether two not-yet-committed assignments would collide with each other.
    pub fn collides(&self, a: &ScheduleCandidate, b: &ScheduleCandidate) -> bool {
        a.service_date == b.service_date
            && (a.driver_id == b.driver_id || a.vehicle_id == b.vehicle_id)
            && a.window().expanded(self.buffer).intersects(&b.window())
    }

    /// Find committed records on `date` that collide with earlier-created
    /// ones.
    ///
    /// Within each colliding pair the record created first is primary; the
    /// other becomes the subject. A subject with several primaries is
    /// reported once.
    pub async fn scan(&self, date: NaiveDate) -> RepositoryResult<Vec<CommittedConflict>> {
        let filter = ScheduleFilter::on_date(date)
            .with_statuses(&[ScheduleStatus::Scheduled, ScheduleStatus::InProgress]);
        let schedules = self.calendar.list(&filter).await?;

        let mut found = Vec::new();
        for subject in schedules {
            let overlaps = self.detect(&subject.to_candidate()).await?;
            let primaries: Vec<ConflictingSchedule> = overlaps
                .into_iter()
                .filter(|o| precedes(&o.schedule, &subject))
                .collect();
            if !primaries.is_empty() {
                found.push(CommittedConflict { subject, primaries });
            }
        }
        log::debug!("Scan of {} found {} conflicting schedule(s)", date, found.len());
        Ok(found)
    }
}

/// Shared resources between `candidate` and `schedule`.
pub fn classify(candidate: &ScheduleCandidate, schedule: &Schedule) -> Vec<OverlapKind> {
    let mut kinds = Vec::with_capacity(2);
    if candidate.driver_id == schedule.driver_id {
        kinds.push(OverlapKind::Driver);
    }
    if candidate.vehicle_id == schedule.vehicle_id {
        kinds.push(OverlapKind::Vehicle);
    }
    kinds
}

fn precedes(a: &Schedule, b: &Schedule) -> bool {
    (a.created_at, a.id) < (b.created_at, b.id)
}
