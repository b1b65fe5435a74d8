//! Risk report produced by the periodic analyzer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::resolution::ImpactLevel;
use super::schedule::{DriverId, RouteId, ScheduleId, VehicleId};

/// Independent per-schedule signals that raise conflict likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    TightConnection,
    DriverFatigue,
    HistoricalConflicts,
}

impl RiskFactor {
    pub const ALL: [RiskFactor; 3] = [
        RiskFactor::TightConnection,
        RiskFactor::DriverFatigue,
        RiskFactor::HistoricalConflicts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskFactor::TightConnection => "tight_connection",
            RiskFactor::DriverFatigue => "driver_fatigue",
            RiskFactor::HistoricalConflicts => "historical_conflicts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    High,
    Medium,
}

impl RiskTier {
    /// Two or more factors are high risk, exactly one is medium, none is unflagged.
    pub fn classify(factor_count: usize) -> Option<RiskTier> {
        match factor_count {
            0 => None,
            1 => Some(RiskTier::Medium),
            _ => Some(RiskTier::High),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRisk {
    pub schedule_id: ScheduleId,
    pub route_id: RouteId,
    pub driver_id: DriverId,
    pub vehicle_id: VehicleId,
    pub service_date: NaiveDate,
    pub factors: Vec<RiskFactor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    RedistributeWorkload,
    AdjustRouteTiming,
    ReviewHighRisk,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::RedistributeWorkload => "redistribute_workload",
            RecommendedAction::AdjustRouteTiming => "adjust_route_timing",
            RecommendedAction::ReviewHighRisk => "review_high_risk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    DriverWorkload,
    RouteTiming,
}

/// Entities singled out by a pattern detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum AffectedEntity {
    Driver {
        driver_id: DriverId,
        schedule_count: usize,
        consecutive_days: usize,
    },
    Route {
        route_id: RouteId,
        average_delay_minutes: f64,
        delayed_trips: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPattern {
    pub kind: PatternKind,
    pub title: String,
    pub description: String,
    pub impact: ImpactLevel,
    pub affected: Vec<AffectedEntity>,
    pub recommended_action: RecommendedAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: ImpactLevel,
    pub title: String,
    pub description: String,
    pub action: RecommendedAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Share of recent schedules without a conflict flag, in percent.
    pub prevention_rate: f64,
    pub high_risk_count: usize,
    pub medium_risk_count: usize,
}

/// A detector that failed during a run. The rest of the report is still valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorFailure {
    pub detector: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub generated_at: DateTime<Utc>,
    pub as_of: NaiveDate,
    pub high_risk: Vec<ScheduleRisk>,
    pub medium_risk: Vec<ScheduleRisk>,
    pub patterns: Vec<RiskPattern>,
    pub metrics: RiskMetrics,
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub failures: Vec<DetectorFailure>,
}

impl RiskReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn pattern(&self, kind: PatternKind) -> Option<&RiskPattern> {
        self.patterns.iter().find(|p| p.kind == kind)
    }
}
