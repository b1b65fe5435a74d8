//! Proactive risk analysis over the active schedule set.
//!
//! A run loads one snapshot of the calendar, evaluates every per-schedule
//! factor and every pattern detector independently, and assembles a
//! [`RiskReport`] from whatever succeeded. Reports are cached until the
//! calendar changes; when runs overlap, the one started last owns the cache.

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::calendar::ResourceCalendar;
use super::risk_detectors::{default_factors, default_patterns, PatternDetector, RiskContext, RiskFactorCheck};
use crate::config::RiskSettings;
use crate::db::{RepositoryError, RepositoryResult};
use crate::models::{
    DetectorFailure, ImpactLevel, RecommendedAction, Recommendation, RiskFactor, RiskMetrics,
    RiskPattern, RiskReport, RiskTier, ScheduleRisk,
};

struct CachedReport {
    run: u64,
    revision: u64,
    report: Arc<RiskReport>,
}

pub struct RiskAnalyzer {
    calendar: Arc<ResourceCalendar>,
    settings: RiskSettings,
    factors: Vec<Arc<dyn RiskFactorCheck>>,
    patterns: Vec<Arc<dyn PatternDetector>>,
    runs: AtomicU64,
    cache: RwLock<Option<CachedReport>>,
}

impl RiskAnalyzer {
    pub fn new(calendar: Arc<ResourceCalendar>, settings: RiskSettings) -> Self {
        Self::with_detectors(calendar, settings, default_factors(), default_patterns())
    }

    pub fn with_detectors(
        calendar: Arc<ResourceCalendar>,
        settings: RiskSettings,
        factors: Vec<Arc<dyn RiskFactorCheck>>,
        patterns: Vec<Arc<dyn PatternDetector>>,
    ) -> Self {
        Self {
            calendar,
            settings,
            factors,
            patterns,
            runs: AtomicU64::new(0),
            cache: RwLock::new(None),
        }
    }

    /// Report for today, served from cache while the calendar is unchanged.
    pub async fn analyze(&self) -> RepositoryResult<Arc<RiskReport>> {
        self.analyze_as_of(Utc::now().date_naive()).await
    }

    pub async fn analyze_as_of(&self, as_of: NaiveDate) -> RepositoryResult<Arc<RiskReport>> {
        if let Some(report) = self.fresh(as_of) {
            log::debug!("Serving cached risk report for {}", as_of);
            return Ok(report);
        }
        self.refresh_as_of(as_of).await
    }

    /// Recompute for today regardless of the cache.
    pub async fn refresh(&self) -> RepositoryResult<Arc<RiskReport>> {
        self.refresh_as_of(Utc::now().date_naive()).await
    }

    pub async fn refresh_as_of(&self, as_of: NaiveDate) -> RepositoryResult<Arc<RiskReport>> {
        let run = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        let revision = self.calendar.revision();
        let report = Arc::new(self.run(as_of).await?);
        self.store(run, revision, report.clone());
        Ok(report)
    }

    /// Most recently stored report, even if the calendar moved on since.
    pub fn latest(&self) -> Option<Arc<RiskReport>> {
        self.cache.read().as_ref().map(|c| c.report.clone())
    }

    fn fresh(&self, as_of: NaiveDate) -> Option<Arc<RiskReport>> {
        let cache = self.cache.read();
        let cached = cache.as_ref()?;
        (cached.revision == self.calendar.revision() && cached.report.as_of == as_of)
            .then(|| cached.report.clone())
    }

    fn store(&self, run: u64, revision: u64, report: Arc<RiskReport>) {
        let mut cache = self.cache.write();
        match cache.as_ref() {
            Some(current) if current.run > run => {
                log::debug!(
                    "Discarding risk run {} superseded by run {}",
                    run,
                    current.run
                );
            }
            _ => {
                *cache = Some(CachedReport {
                    run,
                    revision,
                    report,
                })
            }
        }
    }

    async fn run(&self, as_of: NaiveDate) -> RepositoryResult<RiskReport> {
        let ctx = RiskContext::load(self.calendar.repository().clone(), self.settings.clone(), as_of).await?;
        let mut failures = Vec::new();

        let (high_risk, medium_risk) = self.score_schedules(&ctx, &mut failures).await;
        let patterns = self.detect_patterns(&ctx, &mut failures).await;

        let flagged = ctx.horizon.iter().filter(|s| s.has_conflict).count();
        let total = ctx.horizon.len();
        let metrics = RiskMetrics {
            prevention_rate: if total > 0 {
                (total - flagged) as f64 / total as f64 * 100.0
            } else {
                100.0
            },
            high_risk_count: high_risk.len(),
            medium_risk_count: medium_risk.len(),
        };
        let recommendations = recommendations(&high_risk, &patterns);

        if !failures.is_empty() {
            log::warn!(
                "Risk report for {} assembled without {} failed detector(s)",
                as_of,
                failures.len()
            );
        }
        log::info!(
            "Risk report for {}: {} high, {} medium, {} pattern(s)",
            as_of,
            high_risk.len(),
            medium_risk.len(),
            patterns.len()
        );

        Ok(RiskReport {
            generated_at: Utc::now(),
            as_of,
            high_risk,
            medium_risk,
            patterns,
            metrics,
            recommendations,
            failures,
        })
    }

    async fn score_schedules(
        &self,
        ctx: &RiskContext,
        failures: &mut Vec<DetectorFailure>,
    ) -> (Vec<ScheduleRisk>, Vec<ScheduleRisk>) {
        let upcoming: Vec<_> = ctx.upcoming().collect();

        let evaluations = join_all(self.factors.iter().map(|check| {
            let upcoming = &upcoming;
            async move {
                let mut hits = Vec::with_capacity(upcoming.len());
                for schedule in upcoming.iter() {
                    hits.push(check.evaluate(schedule, ctx).await?);
                }
                Ok::<_, RepositoryError>(hits)
            }
        }))
        .await;

        let mut factors: Vec<Vec<RiskFactor>> = vec![Vec::new(); upcoming.len()];
        for (check, result) in self.factors.iter().zip(evaluations) {
            match result {
                Ok(hits) => {
                    for (slot, hit) in factors.iter_mut().zip(hits) {
                        if hit {
                            slot.push(check.factor());
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Risk factor {} failed: {}", check.factor().as_str(), e);
                    failures.push(DetectorFailure {
                        detector: check.factor().as_str().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut high = Vec::new();
        let mut medium = Vec::new();
        for (schedule, mut found) in upcoming.into_iter().zip(factors) {
            found.sort();
            found.dedup();
            let Some(tier) = RiskTier::classify(found.len()) else {
                continue;
            };
            let risk = ScheduleRisk {
                schedule_id: schedule.id,
                route_id: schedule.route_id,
                driver_id: schedule.driver_id,
                vehicle_id: schedule.vehicle_id.clone(),
                service_date: schedule.service_date,
                factors: found,
            };
            match tier {
                RiskTier::High => high.push(risk),
                RiskTier::Medium => medium.push(risk),
            }
        }
        (high, medium)
    }

    async fn detect_patterns(&self, ctx: &RiskContext, failures: &mut Vec<DetectorFailure>) -> Vec<RiskPattern> {
        let results = join_all(
            self.patterns
                .iter()
                .map(|detector| async move { (detector.name(), detector.detect(ctx).await) }),
        )
        .await;

        let mut patterns = Vec::new();
        for (name, result) in results {
            match result {
                Ok(Some(pattern)) => patterns.push(pattern),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Pattern detector {} failed: {}", name, e);
                    failures.push(DetectorFailure {
                        detector: name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        patterns
    }
}

fn recommendations(high_risk: &[ScheduleRisk], patterns: &[RiskPattern]) -> Vec<Recommendation> {
    let mut out = Vec::new();
    if !high_risk.is_empty() {
        out.push(Recommendation {
            priority: ImpactLevel::High,
            title: "Immediate Schedule Adjustment Needed".to_string(),
            description: format!("{} schedules at high risk of conflict", high_risk.len()),
            action: RecommendedAction::ReviewHighRisk,
        });
    }
    for pattern in patterns {
        out.push(Recommendation {
            priority: if pattern.impact == ImpactLevel::High {
                ImpactLevel::High
            } else {
                ImpactLevel::Medium
            },
            title: format!("Address {}", pattern.title),
            description: pattern.description.clone(),
            action: pattern.recommended_action,
        });
    }
    out
}

/// Background task refreshing the cached report on a fixed cadence.
pub struct RiskMonitor;

impl RiskMonitor {
    pub fn spawn(analyzer: Arc<RiskAnalyzer>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match analyzer.refresh().await {
                    Ok(report) => log::debug!(
                        "Periodic risk refresh done ({} high, {} medium)",
                        report.metrics.high_risk_count,
                        report.metrics.medium_risk_count
                    ),
                    Err(e) => log::warn!("Periodic risk refresh failed: {}", e),
                }
            }
        })
    }
}
