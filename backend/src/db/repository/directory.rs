//! Read access to fleet reference data (drivers, routes).
//!
//! Drivers and routes are administered elsewhere; the dispatch core only
//! resolves them by id and enumerates drivers when looking for substitutes.

use async_trait::async_trait;

use super::error::RepositoryResult;
use crate::models::{Driver, DriverId, Route, RouteId};

#[async_trait]
pub trait FleetDirectory: Send + Sync {
    async fn get_driver(&self, driver_id: DriverId) -> RepositoryResult<Driver>;

    /// All drivers ordered by id.
    async fn list_drivers(&self) -> RepositoryResult<Vec<Driver>>;

    async fn get_route(&self, route_id: RouteId) -> RepositoryResult<Route>;
}
