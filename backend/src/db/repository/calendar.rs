//! Resource calendar store: the authoritative set of schedule records.

use async_trait::async_trait;

use super::error::RepositoryResult;
use crate::models::{OverlapQuery, Schedule, ScheduleCandidate, ScheduleFilter, ScheduleId, SchedulePatch};

/// Writes applied together: either every entry lands or none does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalendarBatch {
    pub inserts: Vec<ScheduleCandidate>,
    pub updates: Vec<(ScheduleId, SchedulePatch)>,
    pub deletes: Vec<ScheduleId>,
}

impl CalendarBatch {
    pub fn insert(mut self, candidate: ScheduleCandidate) -> Self {
        self.inserts.push(candidate);
        self
    }

    pub fn update(mut self, id: ScheduleId, patch: SchedulePatch) -> Self {
        self.updates.push((id, patch));
        self
    }

    pub fn delete(mut self, id: ScheduleId) -> Self {
        self.deletes.push(id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Newly created records, in insertion order.
    pub inserted: Vec<Schedule>,
    /// Records after their patch, in update order.
    pub updated: Vec<Schedule>,
    /// Before-images of `updated`, same order.
    pub previous: Vec<Schedule>,
}

/// Repository trait for the schedule calendar.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
///
/// # Atomicity
/// [`apply_batch`](CalendarRepository::apply_batch) must be all-or-nothing.
/// When it fails part-way it reverts what it already wrote and reports
/// `RepositoryError::TransactionError`.
#[async_trait]
pub trait CalendarRepository: Send + Sync {
    /// Check if the store is reachable.
    async fn health_check(&self) -> RepositoryResult<bool>;

    /// Fetch one record.
    ///
    /// # Returns
    /// * `Err(RepositoryError::NotFound)` - If the schedule doesn't exist
    async fn get_schedule(&self, schedule_id: ScheduleId) -> RepositoryResult<Schedule>;

    /// List records matching `filter`, ordered by service date then departure.
    async fn list_schedules(&self, filter: &ScheduleFilter) -> RepositoryResult<Vec<Schedule>>;

    /// Active records sharing the driver or vehicle of `query` on its date
    /// whose window intersects `query.window`. Ordered by departure.
    async fn find_overlapping(&self, query: &OverlapQuery) -> RepositoryResult<Vec<Schedule>>;

    /// Apply inserts, updates and deletes atomically.
    async fn apply_batch(&self, batch: CalendarBatch) -> RepositoryResult<BatchOutcome>;

    async fn insert_schedule(&self, candidate: ScheduleCandidate) -> RepositoryResult<Schedule> {
        let outcome = self.apply_batch(CalendarBatch::default().insert(candidate)).await?;
        outcome
            .inserted
            .into_iter()
            .next()
            .ok_or_else(|| super::RepositoryError::internal("insert produced no record"))
    }

    /// Patch several records together; all-or-nothing.
    async fn update_many(
        &self,
        updates: Vec<(ScheduleId, SchedulePatch)>,
    ) -> RepositoryResult<Vec<Schedule>> {
        let batch = CalendarBatch {
            updates,
            ..Default::default()
        };
        Ok(self.apply_batch(batch).await?.updated)
    }
}
