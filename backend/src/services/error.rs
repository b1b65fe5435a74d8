//! Error taxonomy for dispatch operations.
//!
//! Store failures surface unchanged through [`DispatchError::Repository`];
//! everything else describes a decision the dispatch core made.

use crate::db::RepositoryError;
use crate::models::{
    ConflictId, ConflictingSchedule, OverlapKind, Schedule, ScheduleCandidate, ScheduleId,
    ScheduleStatus,
};

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The write was rejected because it overlaps committed schedules.
    #[error("{0}")]
    Conflict(Box<ConflictError>),

    #[error(transparent)]
    StaleOption(#[from] StaleOptionError),

    /// An atomic resolution batch failed; nothing was left half-applied.
    #[error("resolution could not be applied: {0}")]
    ExecutionFailed(#[source] RepositoryError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    #[error("invalid schedule: {0}")]
    InvalidCandidate(String),

    #[error("schedule {schedule_id} cannot move from {from} to {to}")]
    InvalidTransition {
        schedule_id: ScheduleId,
        from: ScheduleStatus,
        to: ScheduleStatus,
    },
}

impl DispatchError {
    pub fn as_conflict(&self) -> Option<&ConflictError> {
        match self {
            DispatchError::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, DispatchError::StaleOption(_))
    }
}

impl From<ConflictError> for DispatchError {
    fn from(err: ConflictError) -> Self {
        DispatchError::Conflict(Box::new(err))
    }
}

/// Rejection of a schedule write, carrying what it collided with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "schedule for driver {} / vehicle {} on {} conflicts with {} existing schedule(s)",
    candidate.driver_id,
    candidate.vehicle_id,
    candidate.service_date,
    conflicting.len()
)]
pub struct ConflictError {
    /// Registered conflict, usable with `generate_resolution_options`.
    pub conflict_id: ConflictId,
    pub candidate: ScheduleCandidate,
    pub conflicting: Vec<ConflictingSchedule>,
}

impl ConflictError {
    pub fn conflicting_schedules(&self) -> impl Iterator<Item = &Schedule> {
        self.conflicting.iter().map(|c| &c.schedule)
    }

    pub fn conflicting_ids(&self) -> Vec<ScheduleId> {
        self.conflicting.iter().map(|c| c.schedule.id).collect()
    }

    pub fn kinds(&self) -> Vec<OverlapKind> {
        let mut kinds: Vec<OverlapKind> = self
            .conflicting
            .iter()
            .flat_map(|c| c.kinds.iter().copied())
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

/// A resolution option no longer fits the calendar it was computed against.
/// The calendar is unchanged; regenerate options and try again.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("resolution for conflict {conflict_id} is stale: {reason}")]
pub struct StaleOptionError {
    pub conflict_id: ConflictId,
    pub reason: String,
    /// Schedules the option would now collide with, if that is the reason.
    pub conflicting: Vec<ScheduleId>,
}

impl StaleOptionError {
    pub fn new(conflict_id: ConflictId, reason: impl Into<String>) -> Self {
        Self {
            conflict_id,
            reason: reason.into(),
            conflicting: Vec::new(),
        }
    }

    pub fn with_conflicting(mut self, ids: Vec<ScheduleId>) -> Self {
        self.conflicting = ids;
        self
    }
}
