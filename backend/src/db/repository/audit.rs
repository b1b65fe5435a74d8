//! Audit trail of detected conflicts and applied resolutions.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::error::RepositoryResult;
use crate::models::{ConflictRecord, DriverId, ResolutionRecord, RouteId};

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record_conflict(&self, record: ConflictRecord) -> RepositoryResult<()>;

    async fn record_resolution(&self, record: ResolutionRecord) -> RepositoryResult<()>;

    /// Number of conflicts recorded for a route/driver pair on or after `since`.
    async fn count_conflicts(
        &self,
        route_id: RouteId,
        driver_id: DriverId,
        since: NaiveDate,
    ) -> RepositoryResult<usize>;

    async fn list_resolutions(&self) -> RepositoryResult<Vec<ResolutionRecord>>;
}
