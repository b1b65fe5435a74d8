//! Driver and route reference data owned by the fleet administration side.
//!
//! The dispatch core only reads these through [`crate::db::FleetDirectory`];
//! schedules point at them by id.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::schedule::{DriverId, RouteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Available,
    OnTrip,
    OnLeave,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverStats {
    pub total_trips: u32,
    pub completed_trips: u32,
    pub cancelled_trips: u32,
    /// Percentage of trips that arrived on time.
    pub on_time_rate: f64,
}

impl Default for DriverStats {
    fn default() -> Self {
        Self {
            total_trips: 0,
            completed_trips: 0,
            cancelled_trips: 0,
            on_time_rate: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    pub license_number: String,
    pub status: DriverStatus,
    #[serde(default)]
    pub stats: DriverStats,
}

impl Driver {
    pub fn new(id: i64, name: impl Into<String>, status: DriverStatus) -> Self {
        let name = name.into();
        Self {
            id: DriverId(id),
            license_number: format!("LIC-{:05}", id),
            name,
            status,
            stats: DriverStats::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == DriverStatus::Available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub origin: String,
    pub destination: String,
    /// Planned running time, used to derive the estimated arrival.
    pub duration_minutes: i64,
    pub status: RouteStatus,
}

impl Route {
    pub fn new(id: i64, origin: impl Into<String>, destination: impl Into<String>, duration_minutes: i64) -> Self {
        Self {
            id: RouteId(id),
            origin: origin.into(),
            destination: destination.into(),
            duration_minutes,
            status: RouteStatus::Active,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }

    pub fn label(&self) -> String {
        format!("{} → {}", self.origin, self.destination)
    }
}
