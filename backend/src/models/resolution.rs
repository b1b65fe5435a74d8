//! Remediation options offered for a conflict.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::schedule::{DriverId, ScheduleId};

/// Estimated disruption tier. Ordered from least to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    ReassignDriver,
    Reschedule,
    Swap,
}

impl ResolutionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionType::ReassignDriver => "reassign_driver",
            ResolutionType::Reschedule => "reschedule",
            ResolutionType::Swap => "swap",
        }
    }
}

/// What applying an option changes. Always targets the conflict's
/// non-primary schedule; `Swap` additionally touches `target_schedule_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionAction {
    ReassignDriver {
        driver_id: DriverId,
    },
    Reschedule {
        departure: NaiveDateTime,
        estimated_arrival: NaiveDateTime,
        offset_minutes: i64,
    },
    Swap {
        target_schedule_id: ScheduleId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOption {
    pub action: ResolutionAction,
    pub impact: ImpactLevel,
    pub title: String,
    pub description: String,
    /// Lower is less disruptive; options are ranked on it.
    pub disruption: u32,
}

impl ResolutionOption {
    pub fn kind(&self) -> ResolutionType {
        match self.action {
            ResolutionAction::ReassignDriver { .. } => ResolutionType::ReassignDriver,
            ResolutionAction::Reschedule { .. } => ResolutionType::Reschedule,
            ResolutionAction::Swap { .. } => ResolutionType::Swap,
        }
    }
}
