//! Risk report scenarios driven through the dispatch facade.

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use fleet_dispatch::config::RiskSettings;
use fleet_dispatch::db::{RepositoryError, RepositoryResult};
use fleet_dispatch::models::{
    AffectedEntity, DriverId, ImpactLevel, PatternKind, RecommendedAction, RiskPattern, RouteId,
    ScheduleId, ScheduleStatus,
};
use fleet_dispatch::services::risk_detectors::{default_factors, DriverWorkloadPattern};
use fleet_dispatch::services::{PatternDetector, RiskAnalyzer, RiskContext};
use support::{at, at_on, day, dispatch, service_date, trip};

fn sorted(ids: impl IntoIterator<Item = ScheduleId>) -> Vec<ScheduleId> {
    let mut ids: Vec<_> = ids.into_iter().collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_schedules_are_tiered_by_factor_count() {
    let (repo, service, _) = dispatch();
    // Driver 1: 30 minute connection and 570 planned minutes.
    let a = repo.seed_schedule(&trip(1, "V1", at(5, 0), at(10, 0)), ScheduleStatus::Scheduled);
    let b = repo.seed_schedule(&trip(1, "V2", at(10, 30), at(15, 0)), ScheduleStatus::Scheduled);
    // Driver 2: tight connection only.
    let c = repo.seed_schedule(&trip(2, "V3", at(8, 0), at(10, 0)), ScheduleStatus::Scheduled);
    let d = repo.seed_schedule(&trip(2, "V4", at(10, 30), at(12, 0)), ScheduleStatus::Scheduled);
    repo.seed_schedule(&trip(3, "V5", at(8, 0), at(10, 0)), ScheduleStatus::Scheduled);

    let report = service.analyze_risks_as_of(service_date()).await.unwrap();

    assert_eq!(sorted(report.high_risk.iter().map(|r| r.schedule_id)), vec![a.id, b.id]);
    assert_eq!(sorted(report.medium_risk.iter().map(|r| r.schedule_id)), vec![c.id, d.id]);
    assert!(report.high_risk.iter().all(|r| r.factors.len() >= 2));
    assert_eq!(report.metrics.high_risk_count, 2);
    assert_eq!(report.metrics.medium_risk_count, 2);
    assert_eq!(report.recommendations[0].title, "Immediate Schedule Adjustment Needed");
    assert_eq!(report.recommendations[0].action, RecommendedAction::ReviewHighRisk);
    assert!(report.is_complete());
}

#[tokio::test]
async fn test_sustained_workload_is_reported_as_pattern() {
    let (repo, service, _) = dispatch();
    for offset in 0..6 {
        let date = day(offset);
        repo.seed_schedule(
            &trip(1, "V1", at_on(date, 8, 0), at_on(date, 9, 0)),
            ScheduleStatus::Scheduled,
        );
    }
    for offset in 0..3 {
        let date = day(offset);
        repo.seed_schedule(
            &trip(1, "V1", at_on(date, 14, 0), at_on(date, 15, 0)),
            ScheduleStatus::Scheduled,
        );
    }

    let report = service.analyze_risks_as_of(service_date()).await.unwrap();
    let pattern = report.pattern(PatternKind::DriverWorkload).expect("workload pattern");
    assert_eq!(pattern.impact, ImpactLevel::High);
    assert_eq!(pattern.recommended_action, RecommendedAction::RedistributeWorkload);
    assert_eq!(
        pattern.affected,
        vec![AffectedEntity::Driver {
            driver_id: DriverId(1),
            schedule_count: 9,
            consecutive_days: 6,
        }]
    );
    let recommendation = report
        .recommendations
        .iter()
        .find(|r| r.action == RecommendedAction::RedistributeWorkload)
        .unwrap();
    assert_eq!(recommendation.title, "Address Driver Workload Risk");
    assert_eq!(recommendation.priority, ImpactLevel::High);
}

#[tokio::test]
async fn test_consistently_late_route_is_reported() {
    let (repo, service, _) = dispatch();
    for offset in 1..=6 {
        let date = day(-offset);
        let done = repo.seed_schedule(
            &trip(offset, &format!("V{}", offset), at_on(date, 8, 0), at_on(date, 10, 0)),
            ScheduleStatus::Completed,
        );
        repo.set_actual_arrival(done.id, at_on(date, 10, 20));
    }

    let report = service.analyze_risks_as_of(service_date()).await.unwrap();
    let pattern = report.pattern(PatternKind::RouteTiming).expect("route timing pattern");
    assert_eq!(pattern.impact, ImpactLevel::Medium);
    match &pattern.affected[0] {
        AffectedEntity::Route {
            route_id,
            average_delay_minutes,
            delayed_trips,
        } => {
            assert_eq!(*route_id, RouteId(1));
            assert!((average_delay_minutes - 20.0).abs() < 1e-9);
            assert_eq!(*delayed_trips, 6);
        }
        other => panic!("unexpected entity {other:?}"),
    }
    assert!(report.high_risk.is_empty());
}

#[tokio::test]
async fn test_prevention_rate_counts_flagged_schedules() {
    let (repo, service, _) = dispatch();
    repo.seed_schedule(&trip(1, "V1", at(8, 0), at(10, 0)), ScheduleStatus::Scheduled);
    repo.seed_schedule(&trip(1, "V2", at(9, 0), at(11, 0)), ScheduleStatus::Scheduled);
    repo.seed_schedule(&trip(2, "V3", at(13, 0), at(14, 0)), ScheduleStatus::Scheduled);
    service.scan_conflicts(service_date()).await.unwrap();

    let report = service.analyze_risks_as_of(service_date()).await.unwrap();
    assert!((report.metrics.prevention_rate - 100.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_report_is_cached_until_calendar_changes() {
    let (_repo, service, _) = dispatch();
    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();

    let first = service.analyze_risks_as_of(service_date()).await.unwrap();
    let again = service.analyze_risks_as_of(service_date()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    service.create_schedule(trip(1, "V2", at(10, 45), at(12, 0))).await.unwrap();
    let refreshed = service.analyze_risks_as_of(service_date()).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &refreshed));
    assert_eq!(refreshed.medium_risk.len(), 2);
}

struct OfflinePattern;

#[async_trait]
impl PatternDetector for OfflinePattern {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn detect(&self, _ctx: &RiskContext) -> RepositoryResult<Option<RiskPattern>> {
        Err(RepositoryError::connection("pattern source unavailable"))
    }
}

#[tokio::test]
async fn test_failing_detector_does_not_sink_the_report() {
    let (repo, service, _) = dispatch();
    for offset in 0..6 {
        let date = day(offset);
        repo.seed_schedule(&trip(1, "V1", at_on(date, 6, 0), at_on(date, 7, 0)), ScheduleStatus::Scheduled);
        repo.seed_schedule(&trip(1, "V1", at_on(date, 7, 30), at_on(date, 8, 0)), ScheduleStatus::Scheduled);
    }

    let analyzer = RiskAnalyzer::with_detectors(
        service.calendar().clone(),
        RiskSettings::default(),
        default_factors(),
        vec![Arc::new(OfflinePattern), Arc::new(DriverWorkloadPattern)],
    );
    let report = analyzer.analyze_as_of(service_date()).await.unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].detector, "offline");
    assert!(report.pattern(PatternKind::DriverWorkload).is_some());
    assert_eq!(report.medium_risk.len(), 12);
}

#[tokio::test]
async fn test_unreachable_store_fails_the_run() {
    let (repo, service, _) = dispatch();
    repo.set_healthy(false);
    assert!(service.analyze_risks_as_of(service_date()).await.is_err());
}
