//! Schedule records and the time-window arithmetic used for overlap checks.
//!
//! A [`Schedule`] is one trip assignment: a route on a service date, driven by
//! one driver with one vehicle between `departure` and `estimated_arrival`.
//! Two active schedules that share a driver or a vehicle on the same date must
//! keep their (buffered) windows disjoint.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

crate::define_id_type!(i64, ScheduleId);
crate::define_id_type!(i64, DriverId);
crate::define_id_type!(i64, RouteId);
crate::define_code_type!(VehicleId);

/// Lifecycle state of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    /// Cancelled schedules never take part in conflicts.
    pub fn is_active(self) -> bool {
        !matches!(self, ScheduleStatus::Cancelled)
    }

    /// Allowed transitions: scheduled -> in_progress -> completed, and
    /// scheduled | in_progress -> cancelled.
    pub fn can_transition_to(self, next: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress)
                | (InProgress, Completed)
                | (Scheduled, Cancelled)
                | (InProgress, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::InProgress => "in_progress",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// Widen the window by `buffer` on both sides.
    pub fn expanded(&self, buffer: Duration) -> Self {
        Self {
            start: self.start - buffer,
            end: self.end + buffer,
        }
    }

    pub fn shifted(&self, by: Duration) -> Self {
        Self {
            start: self.start + by,
            end: self.end + by,
        }
    }

    /// `start1 < end2 && start2 < end1`.
    pub fn intersects(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Idle time between two disjoint windows, `None` when they intersect.
    pub fn gap_to(&self, other: &TimeWindow) -> Option<Duration> {
        if self.intersects(other) {
            None
        } else if self.end <= other.start {
            Some(other.start - self.end)
        } else {
            Some(self.start - other.end)
        }
    }
}

/// A committed trip assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub route_id: RouteId,
    pub service_date: NaiveDate,
    pub departure: NaiveDateTime,
    pub estimated_arrival: NaiveDateTime,
    /// Set only once the trip is completed.
    #[serde(default)]
    pub actual_arrival: Option<NaiveDateTime>,
    pub driver_id: DriverId,
    pub vehicle_id: VehicleId,
    pub seat_capacity: u32,
    pub status: ScheduleStatus,
    /// Derived marker maintained by conflict scans; never authoritative.
    #[serde(default)]
    pub has_conflict: bool,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.departure, self.estimated_arrival)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Candidate view of this record, used to re-run detection on it.
    pub fn to_candidate(&self) -> ScheduleCandidate {
        ScheduleCandidate {
            id: Some(self.id),
            route_id: self.route_id,
            service_date: self.service_date,
            departure: self.departure,
            estimated_arrival: self.estimated_arrival,
            driver_id: self.driver_id,
            vehicle_id: self.vehicle_id.clone(),
            seat_capacity: self.seat_capacity,
        }
    }

    pub fn apply_patch(&mut self, patch: &SchedulePatch) {
        if let Some(driver_id) = patch.driver_id {
            self.driver_id = driver_id;
        }
        if let Some(ref vehicle_id) = patch.vehicle_id {
            self.vehicle_id = vehicle_id.clone();
        }
        if let Some(departure) = patch.departure {
            self.departure = departure;
        }
        if let Some(arrival) = patch.estimated_arrival {
            self.estimated_arrival = arrival;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(actual) = patch.actual_arrival {
            self.actual_arrival = Some(actual);
        }
        if let Some(flag) = patch.has_conflict {
            self.has_conflict = flag;
        }
    }

    /// Patch that restores the fields a [`SchedulePatch`] can touch.
    pub fn snapshot_patch(&self) -> SchedulePatch {
        SchedulePatch {
            driver_id: Some(self.driver_id),
            vehicle_id: Some(self.vehicle_id.clone()),
            departure: Some(self.departure),
            estimated_arrival: Some(self.estimated_arrival),
            status: Some(self.status),
            actual_arrival: self.actual_arrival,
            has_conflict: Some(self.has_conflict),
        }
    }

    /// Actual minus estimated arrival, for completed trips.
    pub fn arrival_delay(&self) -> Option<Duration> {
        self.actual_arrival
            .map(|actual| actual - self.estimated_arrival)
    }
}

/// Schedule fields submitted for creation or re-validation.
///
/// `id` is set when the candidate describes a modification of an existing
/// record, so that the record does not conflict with itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleCandidate {
    #[serde(default)]
    pub id: Option<ScheduleId>,
    pub route_id: RouteId,
    pub service_date: NaiveDate,
    pub departure: NaiveDateTime,
    pub estimated_arrival: NaiveDateTime,
    pub driver_id: DriverId,
    pub vehicle_id: VehicleId,
    pub seat_capacity: u32,
}

impl ScheduleCandidate {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.departure, self.estimated_arrival)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.estimated_arrival <= self.departure {
            return Err(format!(
                "estimated arrival {} must be after departure {}",
                self.estimated_arrival, self.departure
            ));
        }
        if self.departure.date() != self.service_date {
            return Err(format!(
                "departure {} is not on service date {}",
                self.departure, self.service_date
            ));
        }
        if self.vehicle_id.as_str().trim().is_empty() {
            return Err("vehicle identifier must not be empty".to_string());
        }
        if self.seat_capacity == 0 {
            return Err("seat capacity must be positive".to_string());
        }
        Ok(())
    }

    pub fn with_patch(&self, patch: &SchedulePatch) -> Self {
        let mut next = self.clone();
        if let Some(driver_id) = patch.driver_id {
            next.driver_id = driver_id;
        }
        if let Some(ref vehicle_id) = patch.vehicle_id {
            next.vehicle_id = vehicle_id.clone();
        }
        if let Some(departure) = patch.departure {
            next.departure = departure;
        }
        if let Some(arrival) = patch.estimated_arrival {
            next.estimated_arrival = arrival;
        }
        next
    }
}

/// Partial update applied by status transitions and resolutions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulePatch {
    pub driver_id: Option<DriverId>,
    pub vehicle_id: Option<VehicleId>,
    pub departure: Option<NaiveDateTime>,
    pub estimated_arrival: Option<NaiveDateTime>,
    pub status: Option<ScheduleStatus>,
    pub actual_arrival: Option<NaiveDateTime>,
    pub has_conflict: Option<bool>,
}

impl SchedulePatch {
    pub fn reassign_driver(driver_id: DriverId) -> Self {
        Self {
            driver_id: Some(driver_id),
            ..Default::default()
        }
    }

    pub fn retime(departure: NaiveDateTime, estimated_arrival: NaiveDateTime) -> Self {
        Self {
            departure: Some(departure),
            estimated_arrival: Some(estimated_arrival),
            ..Default::default()
        }
    }

    pub fn assignment(driver_id: DriverId, vehicle_id: VehicleId) -> Self {
        Self {
            driver_id: Some(driver_id),
            vehicle_id: Some(vehicle_id),
            ..Default::default()
        }
    }

    pub fn status(status: ScheduleStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn conflict_flag(flag: bool) -> Self {
        Self {
            has_conflict: Some(flag),
            ..Default::default()
        }
    }

    pub fn with_conflict_flag(mut self, flag: bool) -> Self {
        self.has_conflict = Some(flag);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == SchedulePatch::default()
    }
}

/// Windowed lookup of active schedules sharing a driver or a vehicle.
///
/// A record matches when it is active, is on `service_date`, is not listed in
/// `exclude`, shares the driver *or* the vehicle, and its raw window
/// intersects `window`.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapQuery {
    pub driver_id: Option<DriverId>,
    pub vehicle_id: Option<VehicleId>,
    pub service_date: NaiveDate,
    pub window: TimeWindow,
    pub exclude: Vec<ScheduleId>,
}

impl OverlapQuery {
    /// Query for a candidate whose window is widened by `buffer`.
    pub fn for_candidate(candidate: &ScheduleCandidate, buffer: Duration) -> Self {
        Self {
            driver_id: Some(candidate.driver_id),
            vehicle_id: Some(candidate.vehicle_id.clone()),
            service_date: candidate.service_date,
            window: candidate.window().expanded(buffer),
            exclude: candidate.id.into_iter().collect(),
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = ScheduleId>) -> Self {
        for id in ids {
            if !self.exclude.contains(&id) {
                self.exclude.push(id);
            }
        }
        self
    }

    pub fn matches(&self, schedule: &Schedule) -> bool {
        if !schedule.is_active()
            || schedule.service_date != self.service_date
            || self.exclude.contains(&schedule.id)
        {
            return false;
        }
        let same_driver = self.driver_id == Some(schedule.driver_id);
        let same_vehicle = self.vehicle_id.as_ref() == Some(&schedule.vehicle_id);
        (same_driver || same_vehicle) && self.window.intersects(&schedule.window())
    }
}

/// Listing filter; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub driver_id: Option<DriverId>,
    pub route_id: Option<RouteId>,
    /// Empty means any status.
    pub statuses: Vec<ScheduleStatus>,
}

impl ScheduleFilter {
    pub fn on_date(date: NaiveDate) -> Self {
        Self {
            from: Some(date),
            to: Some(date),
            ..Default::default()
        }
    }

    pub fn since(date: NaiveDate) -> Self {
        Self {
            from: Some(date),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[ScheduleStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn matches(&self, schedule: &Schedule) -> bool {
        self.from.map_or(true, |from| schedule.service_date >= from)
            && self.to.map_or(true, |to| schedule.service_date <= to)
            && self.driver_id.map_or(true, |d| schedule.driver_id == d)
            && self.route_id.map_or(true, |r| schedule.route_id == r)
            && (self.statuses.is_empty() || self.statuses.contains(&schedule.status))
    }
}
