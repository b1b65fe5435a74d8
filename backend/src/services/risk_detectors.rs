//! Individual risk signals evaluated by the risk analyzer.
//!
//! Per-schedule factors implement [`RiskFactorCheck`]; fleet-wide patterns
//! implement [`PatternDetector`]. Each runs independently against a shared
//! [`RiskContext`] snapshot, so that one failing detector only removes its
//! own contribution from the report.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::RiskSettings;
use crate::db::{FullRepository, RepositoryResult};
use crate::models::{
    AffectedEntity, DriverId, ImpactLevel, PatternKind, RecommendedAction, RiskFactor, RiskPattern,
    RouteId, Schedule, ScheduleFilter, ScheduleStatus, VehicleId,
};

/// Calendar snapshot shared by every detector in one analysis run.
pub struct RiskContext {
    pub as_of: NaiveDate,
    pub settings: RiskSettings,
    pub repo: Arc<dyn FullRepository>,
    /// Non-cancelled schedules dated on or after `as_of - lookback_days`.
    pub horizon: Vec<Schedule>,
    by_driver_day: HashMap<(DriverId, NaiveDate), Vec<usize>>,
    by_vehicle_day: HashMap<(VehicleId, NaiveDate), Vec<usize>>,
    historical: Mutex<HashMap<(RouteId, DriverId), usize>>,
}

impl RiskContext {
    pub async fn load(
        repo: Arc<dyn FullRepository>,
        settings: RiskSettings,
        as_of: NaiveDate,
    ) -> RepositoryResult<Self> {
        let since = as_of - Duration::days(settings.lookback_days);
        let horizon: Vec<Schedule> = repo
            .list_schedules(&ScheduleFilter::since(since))
            .await?
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        Ok(Self::from_schedules(repo, settings, as_of, horizon))
    }

    pub fn from_schedules(
        repo: Arc<dyn FullRepository>,
        settings: RiskSettings,
        as_of: NaiveDate,
        horizon: Vec<Schedule>,
    ) -> Self {
        let mut by_driver_day: HashMap<_, Vec<usize>> = HashMap::new();
        let mut by_vehicle_day: HashMap<_, Vec<usize>> = HashMap::new();
        for (idx, s) in horizon.iter().enumerate() {
            by_driver_day
                .entry((s.driver_id, s.service_date))
                .or_default()
                .push(idx);
            by_vehicle_day
                .entry((s.vehicle_id.clone(), s.service_date))
                .or_default()
                .push(idx);
        }
        Self {
            as_of,
            settings,
            repo,
            horizon,
            by_driver_day,
            by_vehicle_day,
            historical: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookback_start(&self) -> NaiveDate {
        self.as_of - Duration::days(self.settings.lookback_days)
    }

    /// Schedules still ahead that the factors are evaluated on.
    pub fn upcoming(&self) -> impl Iterator<Item = &Schedule> + '_ {
        self.horizon
            .iter()
            .filter(move |s| s.status == ScheduleStatus::Scheduled && s.service_date >= self.as_of)
    }

    /// Other trips of the same driver on the same date.
    pub fn driver_day<'a>(&'a self, schedule: &'a Schedule) -> impl Iterator<Item = &'a Schedule> + 'a {
        self.indexed(
            self.by_driver_day.get(&(schedule.driver_id, schedule.service_date)),
            schedule,
        )
    }

    /// Other trips of the same vehicle on the same date.
    pub fn vehicle_day<'a>(&'a self, schedule: &'a Schedule) -> impl Iterator<Item = &'a Schedule> + 'a {
        self.indexed(
            self.by_vehicle_day
                .get(&(schedule.vehicle_id.clone(), schedule.service_date)),
            schedule,
        )
    }

    fn indexed<'a>(
        &'a self,
        indices: Option<&'a Vec<usize>>,
        schedule: &'a Schedule,
    ) -> impl Iterator<Item = &'a Schedule> + 'a {
        indices
            .into_iter()
            .flatten()
            .map(move |&i| &self.horizon[i])
            .filter(move |other| other.id != schedule.id)
    }

    /// Recorded conflicts for a route/driver pair within the lookback,
    /// queried once per pair per run.
    pub async fn historical_conflicts(&self, route_id: RouteId, driver_id: DriverId) -> RepositoryResult<usize> {
        let cached = self.historical.lock().get(&(route_id, driver_id)).copied();
        if let Some(count) = cached {
            return Ok(count);
        }
        let count = self
            .repo
            .count_conflicts(route_id, driver_id, self.lookback_start())
            .await?;
        self.historical.lock().insert((route_id, driver_id), count);
        Ok(count)
    }
}

/// A boolean per-schedule risk signal.
#[async_trait]
pub trait RiskFactorCheck: Send + Sync {
    fn factor(&self) -> RiskFactor;

    async fn evaluate(&self, schedule: &Schedule, ctx: &RiskContext) -> RepositoryResult<bool>;
}

/// A fleet-wide pattern over the snapshot.
#[async_trait]
pub trait PatternDetector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(&self, ctx: &RiskContext) -> RepositoryResult<Option<RiskPattern>>;
}

/// Another trip of the same driver or vehicle that day leaves less than
/// `tight_connection_minutes` of slack.
pub struct TightConnection;

#[async_trait]
impl RiskFactorCheck for TightConnection {
    fn factor(&self) -> RiskFactor {
        RiskFactor::TightConnection
    }

    async fn evaluate(&self, schedule: &Schedule, ctx: &RiskContext) -> RepositoryResult<bool> {
        let threshold = Duration::minutes(ctx.settings.tight_connection_minutes);
        let window = schedule.window();
        Ok(ctx
            .driver_day(schedule)
            .chain(ctx.vehicle_day(schedule))
            .any(|other| match window.gap_to(&other.window()) {
                Some(gap) => gap < threshold,
                None => true,
            }))
    }
}

/// The driver's planned minutes that day exceed `fatigue_max_daily_minutes`.
pub struct DriverFatigue;

#[async_trait]
impl RiskFactorCheck for DriverFatigue {
    fn factor(&self) -> RiskFactor {
        RiskFactor::DriverFatigue
    }

    async fn evaluate(&self, schedule: &Schedule, ctx: &RiskContext) -> RepositoryResult<bool> {
        let planned: i64 = std::iter::once(schedule)
            .chain(ctx.driver_day(schedule))
            .map(|s| s.window().duration().num_minutes())
            .sum();
        Ok(planned > ctx.settings.fatigue_max_daily_minutes)
    }
}

/// The route/driver pair has a record of repeated conflicts.
pub struct HistoricalConflicts;

#[async_trait]
impl RiskFactorCheck for HistoricalConflicts {
    fn factor(&self) -> RiskFactor {
        RiskFactor::HistoricalConflicts
    }

    async fn evaluate(&self, schedule: &Schedule, ctx: &RiskContext) -> RepositoryResult<bool> {
        let count = ctx
            .historical_conflicts(schedule.route_id, schedule.driver_id)
            .await?;
        Ok(count >= ctx.settings.historical_conflict_threshold)
    }
}

/// Drivers with many trips over a long unbroken run of working days.
pub struct DriverWorkloadPattern;

#[async_trait]
impl PatternDetector for DriverWorkloadPattern {
    fn name(&self) -> &'static str {
        "driver_workload"
    }

    async fn detect(&self, ctx: &RiskContext) -> RepositoryResult<Option<RiskPattern>> {
        let mut per_driver: BTreeMap<DriverId, (usize, BTreeSet<NaiveDate>)> = BTreeMap::new();
        for s in &ctx.horizon {
            let entry = per_driver.entry(s.driver_id).or_default();
            entry.0 += 1;
            entry.1.insert(s.service_date);
        }

        let affected: Vec<AffectedEntity> = per_driver
            .into_iter()
            .filter_map(|(driver_id, (count, days))| {
                let streak = longest_streak(&days);
                (count > ctx.settings.workload_min_schedules
                    && streak > ctx.settings.workload_min_consecutive_days)
                    .then_some(AffectedEntity::Driver {
                        driver_id,
                        schedule_count: count,
                        consecutive_days: streak,
                    })
            })
            .collect();

        if affected.is_empty() {
            return Ok(None);
        }
        Ok(Some(RiskPattern {
            kind: PatternKind::DriverWorkload,
            title: "Driver Workload Risk".to_string(),
            description: format!(
                "{} driver(s) with high workload over consecutive days",
                affected.len()
            ),
            impact: ImpactLevel::High,
            affected,
            recommended_action: RecommendedAction::RedistributeWorkload,
        }))
    }
}

/// Routes whose completed trips arrive late on average.
pub struct RouteTimingPattern;

#[async_trait]
impl PatternDetector for RouteTimingPattern {
    fn name(&self) -> &'static str {
        "route_timing"
    }

    async fn detect(&self, ctx: &RiskContext) -> RepositoryResult<Option<RiskPattern>> {
        let filter = ScheduleFilter::since(ctx.lookback_start()).with_statuses(&[ScheduleStatus::Completed]);
        let completed = ctx.repo.list_schedules(&filter).await?;

        let mut per_route: BTreeMap<RouteId, Vec<i64>> = BTreeMap::new();
        for s in &completed {
            if let Some(delay) = s.arrival_delay() {
                per_route.entry(s.route_id).or_default().push(delay.num_minutes());
            }
        }

        let affected: Vec<AffectedEntity> = per_route
            .into_iter()
            .filter_map(|(route_id, delays)| {
                let average = delays.iter().sum::<i64>() as f64 / delays.len() as f64;
                let delayed = delays.iter().filter(|d| **d > 0).count();
                (average > ctx.settings.route_delay_minutes as f64
                    && delayed > ctx.settings.route_min_delayed_trips)
                    .then_some(AffectedEntity::Route {
                        route_id,
                        average_delay_minutes: average,
                        delayed_trips: delayed,
                    })
            })
            .collect();

        if affected.is_empty() {
            return Ok(None);
        }
        Ok(Some(RiskPattern {
            kind: PatternKind::RouteTiming,
            title: "Route Timing Risk".to_string(),
            description: format!("Consistent delays on {} route(s)", affected.len()),
            impact: ImpactLevel::Medium,
            affected,
            recommended_action: RecommendedAction::AdjustRouteTiming,
        }))
    }
}

/// Length of the longest run of consecutive dates.
fn longest_streak(days: &BTreeSet<NaiveDate>) -> usize {
    let mut best = 0;
    let mut current = 0;
    let mut previous: Option<NaiveDate> = None;
    for day in days {
        current = match previous {
            Some(p) if p.succ_opt() == Some(*day) => current + 1,
            _ => 1,
        };
        best = best.max(current);
        previous = Some(*day);
    }
    best
}

pub fn default_factors() -> Vec<Arc<dyn RiskFactorCheck>> {
    vec![
        Arc::new(TightConnection),
        Arc::new(DriverFatigue),
        Arc::new(HistoricalConflicts),
    ]
}

pub fn default_patterns() -> Vec<Arc<dyn PatternDetector>> {
    vec![Arc::new(DriverWorkloadPattern), Arc::new(RouteTimingPattern)]
}
