//! In-memory local repository implementation.
//!
//! This module provides a local implementation of all repository traits
//! suitable for unit testing and local development. All data is stored in
//! memory behind one lock, which makes every batch trivially atomic and keeps
//! iteration order deterministic.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::repository::*;
use crate::models::*;

/// In-memory local repository.
///
/// # Example
/// ```
/// use fleet_dispatch::db::repositories::LocalRepository;
/// use fleet_dispatch::models::{Driver, DriverStatus};
///
/// let repo = LocalRepository::new();
/// repo.insert_driver(Driver::new(1, "Ada", DriverStatus::Available));
/// assert_eq!(repo.schedule_count(), 0);
/// ```
#[derive(Clone)]
pub struct LocalRepository {
    data: Arc<RwLock<LocalData>>,
}

struct LocalData {
    schedules: BTreeMap<ScheduleId, Schedule>,
    drivers: BTreeMap<DriverId, Driver>,
    routes: BTreeMap<RouteId, Route>,

    // Audit trail
    conflict_records: Vec<ConflictRecord>,
    resolution_records: Vec<ResolutionRecord>,

    next_schedule_id: ScheduleId,

    // Connection health
    is_healthy: bool,

    // Fault injection: fail a batch once this many of its writes have landed
    fail_after_writes: Option<usize>,
}

impl Default for LocalData {
    fn default() -> Self {
        Self {
            schedules: BTreeMap::new(),
            drivers: BTreeMap::new(),
            routes: BTreeMap::new(),
            conflict_records: Vec::new(),
            resolution_records: Vec::new(),
            next_schedule_id: ScheduleId(1),
            is_healthy: true,
            fail_after_writes: None,
        }
    }
}

impl LocalData {
    fn allocate_id(&mut self) -> ScheduleId {
        let id = self.next_schedule_id;
        self.next_schedule_id = ScheduleId(id.0 + 1);
        id
    }

    fn materialize(&mut self, candidate: &ScheduleCandidate, status: ScheduleStatus) -> Schedule {
        let id = self.allocate_id();
        Schedule {
            id,
            route_id: candidate.route_id,
            service_date: candidate.service_date,
            departure: candidate.departure,
            estimated_arrival: candidate.estimated_arrival,
            actual_arrival: None,
            driver_id: candidate.driver_id,
            vehicle_id: candidate.vehicle_id.clone(),
            seat_capacity: candidate.seat_capacity,
            status,
            has_conflict: false,
            created_at: Utc::now(),
        }
    }
}

impl LocalRepository {
    /// Create a new empty local repository.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(LocalData::default())),
        }
    }

    pub fn insert_driver(&self, driver: Driver) {
        self.data.write().drivers.insert(driver.id, driver);
    }

    pub fn set_driver_status(&self, driver_id: DriverId, status: DriverStatus) {
        if let Some(driver) = self.data.write().drivers.get_mut(&driver_id) {
            driver.status = status;
        }
    }

    pub fn insert_route(&self, route: Route) {
        self.data.write().routes.insert(route.id, route);
    }

    /// Store a schedule without any conflict detection.
    ///
    /// This is a helper for setting up data, standing in for records that
    /// arrived through imports. The schedule is assigned an ID automatically.
    pub fn seed_schedule(&self, candidate: &ScheduleCandidate, status: ScheduleStatus) -> Schedule {
        let mut data = self.data.write();
        let schedule = data.materialize(candidate, status);
        data.schedules.insert(schedule.id, schedule.clone());
        schedule
    }

    /// Overwrite the actual arrival of a stored record.
    pub fn set_actual_arrival(&self, schedule_id: ScheduleId, actual: chrono::NaiveDateTime) {
        if let Some(schedule) = self.data.write().schedules.get_mut(&schedule_id) {
            schedule.actual_arrival = Some(actual);
        }
    }

    /// Set the health status for testing connection failures.
    pub fn set_healthy(&self, healthy: bool) {
        self.data.write().is_healthy = healthy;
    }

    /// Make the next batch fail after `writes` of its entries were applied.
    /// The failing batch is rolled back and the hook is cleared.
    pub fn fail_after_writes(&self, writes: usize) {
        self.data.write().fail_after_writes = Some(writes);
    }

    /// Clear all data from the repository.
    pub fn clear(&self) {
        let mut data = self.data.write();
        *data = LocalData {
            is_healthy: data.is_healthy,
            ..Default::default()
        };
    }

    /// Get the number of schedules stored.
    pub fn schedule_count(&self) -> usize {
        self.data.read().schedules.len()
    }

    /// Helper to check health and return error if unhealthy.
    fn check_health(&self, operation: &str) -> RepositoryResult<()> {
        if !self.data.read().is_healthy {
            return Err(RepositoryError::connection("Store is not reachable").with_operation(operation));
        }
        Ok(())
    }

    fn missing_schedule(schedule_id: ScheduleId, operation: &str) -> RepositoryError {
        RepositoryError::not_found_with_context(
            format!("Schedule {} not found", schedule_id),
            ErrorContext::new(operation)
                .with_entity("schedule")
                .with_entity_id(schedule_id),
        )
    }

    fn sorted(mut schedules: Vec<Schedule>) -> Vec<Schedule> {
        schedules.sort_by(|a, b| {
            (a.service_date, a.departure, a.id).cmp(&(b.service_date, b.departure, b.id))
        });
        schedules
    }
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Undo information for a batch in flight.
enum Undo {
    Inserted(ScheduleId),
    Updated(Schedule),
    Deleted(Schedule),
}

fn rollback(data: &mut LocalData, journal: Vec<Undo>) {
    for entry in journal.into_iter().rev() {
        match entry {
            Undo::Inserted(id) => {
                data.schedules.remove(&id);
            }
            Undo::Updated(before) | Undo::Deleted(before) => {
                data.schedules.insert(before.id, before);
            }
        }
    }
}

#[async_trait]
impl CalendarRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        Ok(self.data.read().is_healthy)
    }

    async fn get_schedule(&self, schedule_id: ScheduleId) -> RepositoryResult<Schedule> {
        self.check_health("get_schedule")?;
        self.data
            .read()
            .schedules
            .get(&schedule_id)
            .cloned()
            .ok_or_else(|| Self::missing_schedule(schedule_id, "get_schedule"))
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> RepositoryResult<Vec<Schedule>> {
        self.check_health("list_schedules")?;
        let data = self.data.read();
        let found = data
            .schedules
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        Ok(Self::sorted(found))
    }

    async fn find_overlapping(&self, query: &OverlapQuery) -> RepositoryResult<Vec<Schedule>> {
        self.check_health("find_overlapping")?;
        let data = self.data.read();
        let found = data
            .schedules
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        Ok(Self::sorted(found))
    }

    async fn apply_batch(&self, batch: CalendarBatch) -> RepositoryResult<BatchOutcome> {
        self.check_health("apply_batch")?;
        let mut data = self.data.write();

        // Reject unknown targets before touching anything.
        for id in batch.updates.iter().map(|(id, _)| id).chain(batch.deletes.iter()) {
            if !data.schedules.contains_key(id) {
                return Err(Self::missing_schedule(*id, "apply_batch"));
            }
        }

        let fail_after = data.fail_after_writes.take();
        let mut journal = Vec::with_capacity(batch.write_count());
        let mut outcome = BatchOutcome::default();

        let check_fault = |journal: &Vec<Undo>| fail_after.map_or(false, |n| journal.len() >= n);

        for candidate in &batch.inserts {
            if check_fault(&journal) {
                rollback(&mut data, journal);
                return Err(injected_fault());
            }
            let schedule = data.materialize(candidate, ScheduleStatus::Scheduled);
            journal.push(Undo::Inserted(schedule.id));
            data.schedules.insert(schedule.id, schedule.clone());
            outcome.inserted.push(schedule);
        }

        for (id, patch) in &batch.updates {
            if check_fault(&journal) {
                rollback(&mut data, journal);
                return Err(injected_fault());
            }
            let Some(current) = data.schedules.get_mut(id) else {
                rollback(&mut data, journal);
                return Err(Self::missing_schedule(*id, "apply_batch"));
            };
            let before = current.clone();
            current.apply_patch(patch);
            outcome.updated.push(current.clone());
            outcome.previous.push(before.clone());
            journal.push(Undo::Updated(before));
        }

        for id in &batch.deletes {
            if check_fault(&journal) {
                rollback(&mut data, journal);
                return Err(injected_fault());
            }
            if let Some(before) = data.schedules.remove(id) {
                journal.push(Undo::Deleted(before));
            }
        }

        Ok(outcome)
    }
}

fn injected_fault() -> RepositoryError {
    RepositoryError::transaction_with_context(
        "batch aborted, partial writes reverted",
        ErrorContext::new("apply_batch").with_details("injected fault"),
    )
}

#[async_trait]
impl FleetDirectory for LocalRepository {
    async fn get_driver(&self, driver_id: DriverId) -> RepositoryResult<Driver> {
        self.check_health("get_driver")?;
        self.data.read().drivers.get(&driver_id).cloned().ok_or_else(|| {
            RepositoryError::not_found_with_context(
                format!("Driver {} not found", driver_id),
                ErrorContext::new("get_driver")
                    .with_entity("driver")
                    .with_entity_id(driver_id),
            )
        })
    }

    async fn list_drivers(&self) -> RepositoryResult<Vec<Driver>> {
        self.check_health("list_drivers")?;
        Ok(self.data.read().drivers.values().cloned().collect())
    }

    async fn get_route(&self, route_id: RouteId) -> RepositoryResult<Route> {
        self.check_health("get_route")?;
        self.data.read().routes.get(&route_id).cloned().ok_or_else(|| {
            RepositoryError::not_found_with_context(
                format!("Route {} not found", route_id),
                ErrorContext::new("get_route")
                    .with_entity("route")
                    .with_entity_id(route_id),
            )
        })
    }
}

#[async_trait]
impl AuditRepository for LocalRepository {
    async fn record_conflict(&self, record: ConflictRecord) -> RepositoryResult<()> {
        self.check_health("record_conflict")?;
        self.data.write().conflict_records.push(record);
        Ok(())
    }

    async fn record_resolution(&self, record: ResolutionRecord) -> RepositoryResult<()> {
        self.check_health("record_resolution")?;
        self.data.write().resolution_records.push(record);
        Ok(())
    }

    async fn count_conflicts(
        &self,
        route_id: RouteId,
        driver_id: DriverId,
        since: NaiveDate,
    ) -> RepositoryResult<usize> {
        self.check_health("count_conflicts")?;
        Ok(self
            .data
            .read()
            .conflict_records
            .iter()
            .filter(|r| r.route_id == route_id && r.driver_id == driver_id && r.service_date >= since)
            .count())
    }

    async fn list_resolutions(&self) -> RepositoryResult<Vec<ResolutionRecord>> {
        self.check_health("list_resolutions")?;
        Ok(self.data.read().resolution_records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, NaiveTime};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap())
    }

    fn candidate(driver: i64, vehicle: &str, dep: NaiveDateTime, arr: NaiveDateTime) -> ScheduleCandidate {
        ScheduleCandidate {
            id: None,
            route_id: RouteId(1),
            service_date: dep.date(),
            departure: dep,
            estimated_arrival: arr,
            driver_id: DriverId(driver),
            vehicle_id: VehicleId::new(vehicle),
            seat_capacity: 40,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let repo = LocalRepository::new();
        let a = repo.insert_schedule(candidate(1, "V1", at(8, 0), at(10, 0))).await.unwrap();
        let b = repo.insert_schedule(candidate(2, "V2", at(8, 0), at(10, 0))).await.unwrap();
        assert_eq!(a.id, ScheduleId(1));
        assert_eq!(b.id, ScheduleId(2));
        assert_eq!(a.status, ScheduleStatus::Scheduled);
        assert_eq!(repo.schedule_count(), 2);
    }

    #[tokio::test]
    async fn test_find_overlapping_orders_by_departure() {
        let repo = LocalRepository::new();
        repo.seed_schedule(&candidate(1, "V1", at(12, 0), at(13, 0)), ScheduleStatus::Scheduled);
        repo.seed_schedule(&candidate(1, "V2", at(8, 0), at(9, 0)), ScheduleStatus::Scheduled);
        repo.seed_schedule(&candidate(2, "V3", at(8, 0), at(9, 0)), ScheduleStatus::Scheduled);

        let query = OverlapQuery {
            driver_id: Some(DriverId(1)),
            vehicle_id: None,
            service_date: at(0, 0).date(),
            window: TimeWindow::new(at(0, 0), at(23, 0)),
            exclude: vec![],
        };
        let found = repo.find_overlapping(&query).await.unwrap();
        let departures: Vec<_> = found.iter().map(|s| s.departure).collect();
        assert_eq!(departures, vec![at(8, 0), at(12, 0)]);
    }

    #[tokio::test]
    async fn test_update_many_is_all_or_nothing() {
        let repo = LocalRepository::new();
        let a = repo.seed_schedule(&candidate(1, "V1", at(8, 0), at(10, 0)), ScheduleStatus::Scheduled);
        let b = repo.seed_schedule(&candidate(2, "V2", at(8, 0), at(10, 0)), ScheduleStatus::Scheduled);

        repo.fail_after_writes(1);
        let result = repo
            .update_many(vec![
                (a.id, SchedulePatch::assignment(b.driver_id, b.vehicle_id.clone())),
                (b.id, SchedulePatch::assignment(a.driver_id, a.vehicle_id.clone())),
            ])
            .await;
        assert!(matches!(result, Err(RepositoryError::TransactionError { .. })));

        assert_eq!(repo.get_schedule(a.id).await.unwrap(), a);
        assert_eq!(repo.get_schedule(b.id).await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_unknown_update_target_writes_nothing() {
        let repo = LocalRepository::new();
        let batch = CalendarBatch::default()
            .insert(candidate(1, "V1", at(8, 0), at(10, 0)))
            .update(ScheduleId(99), SchedulePatch::reassign_driver(DriverId(2)));
        let err = repo.apply_batch(batch).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(repo.schedule_count(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_store_fails_calls() {
        let repo = LocalRepository::new();
        repo.set_healthy(false);
        assert!(!repo.health_check().await.unwrap());
        let err = repo.list_schedules(&ScheduleFilter::default()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::ConnectionError { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_conflict_counts_by_route_and_driver() {
        let repo = LocalRepository::new();
        let date = at(0, 0).date();
        for (route, driver) in [(1, 1), (1, 1), (1, 2), (2, 1)] {
            repo.record_conflict(ConflictRecord {
                conflict_id: ConflictId(1),
                route_id: RouteId(route),
                driver_id: DriverId(driver),
                vehicle_id: VehicleId::new("V1"),
                service_date: date,
                kinds: vec![OverlapKind::Driver],
                detected_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        let count = repo.count_conflicts(RouteId(1), DriverId(1), date).await.unwrap();
        assert_eq!(count, 2);
        let later = date.succ_opt().unwrap();
        assert_eq!(repo.count_conflicts(RouteId(1), DriverId(1), later).await.unwrap(), 0);
    }
}
