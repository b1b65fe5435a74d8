//! Events published to observers and the topics they are addressed to.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::conflict::ConflictId;
use super::schedule::{DriverId, Schedule, ScheduleId};

/// Subscriber roles that receive role-addressed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Dispatcher,
    Driver,
}

/// Named publish/subscribe address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Role(Role),
    Driver(DriverId),
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Role(role) => write!(f, "role:{:?}", role),
            Topic::Driver(id) => write!(f, "driver:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DispatchEvent {
    ScheduleConflict {
        driver_id: DriverId,
        date: NaiveDate,
        conflicting_schedule: Schedule,
    },
    ScheduleUpdate {
        schedule: Schedule,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        schedules: Vec<ScheduleId>,
    },
}

impl DispatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::ScheduleConflict { .. } => "scheduleConflict",
            DispatchEvent::ScheduleUpdate { .. } => "scheduleUpdate",
            DispatchEvent::ConflictResolved { .. } => "conflictResolved",
        }
    }
}
