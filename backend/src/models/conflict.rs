//! Conflicts between schedules and the audit records kept about them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::resolution::ResolutionOption;
use super::schedule::{DriverId, RouteId, Schedule, ScheduleCandidate, ScheduleId, VehicleId};

crate::define_id_type!(i64, ConflictId);

/// Which shared resource makes two schedules collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapKind {
    Driver,
    Vehicle,
}

/// An existing schedule that intersects a candidate, with every resource
/// the two share. Both kinds are reported when both overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictingSchedule {
    pub schedule: Schedule,
    pub kinds: Vec<OverlapKind>,
}

/// A detected double-booking.
///
/// `candidate` is the non-primary side, i.e. the later write whose
/// assignment gets remediated. Its `id` is `None` while the write is still
/// pending (rejected by `create_schedule`) and `Some` when both sides are
/// already committed. `conflicting` lists the primary schedules it collides
/// with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub candidate: ScheduleCandidate,
    pub conflicting: Vec<ScheduleId>,
    pub kinds: Vec<OverlapKind>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<ResolutionOption>,
}

impl Conflict {
    pub fn new(id: ConflictId, candidate: ScheduleCandidate, overlaps: &[ConflictingSchedule]) -> Self {
        let mut kinds: Vec<OverlapKind> = overlaps.iter().flat_map(|o| o.kinds.iter().copied()).collect();
        kinds.sort();
        kinds.dedup();
        Self {
            id,
            candidate,
            conflicting: overlaps.iter().map(|o| o.schedule.id).collect(),
            kinds,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.candidate.id.is_none()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Closed because it stopped holding, not by an applied option.
    pub fn is_dismissed(&self) -> bool {
        self.is_resolved() && self.resolution.is_none()
    }

    /// Every committed schedule taking part in the conflict.
    pub fn schedule_ids(&self) -> Vec<ScheduleId> {
        self.candidate
            .id
            .into_iter()
            .chain(self.conflicting.iter().copied())
            .collect()
    }

    pub fn involves(&self, schedule_id: ScheduleId) -> bool {
        self.candidate.id == Some(schedule_id) || self.conflicting.contains(&schedule_id)
    }
}

/// Audit entry written whenever a conflict is detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub route_id: RouteId,
    pub driver_id: DriverId,
    pub vehicle_id: VehicleId,
    pub service_date: NaiveDate,
    pub kinds: Vec<OverlapKind>,
    pub detected_at: DateTime<Utc>,
}

impl From<&Conflict> for ConflictRecord {
    fn from(conflict: &Conflict) -> Self {
        Self {
            conflict_id: conflict.id,
            route_id: conflict.candidate.route_id,
            driver_id: conflict.candidate.driver_id,
            vehicle_id: conflict.candidate.vehicle_id.clone(),
            service_date: conflict.candidate.service_date,
            kinds: conflict.kinds.clone(),
            detected_at: conflict.detected_at,
        }
    }
}

/// Audit entry written when a resolution has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub conflict_id: ConflictId,
    pub option: ResolutionOption,
    pub affected: Vec<ScheduleId>,
    pub applied_at: DateTime<Utc>,
}
