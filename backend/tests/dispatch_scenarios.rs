//! End-to-end dispatch flows over the in-memory repository.

mod support;

use std::sync::Arc;

use fleet_dispatch::db::{AuditRepository, CalendarRepository};
use fleet_dispatch::models::{
    DispatchEvent, Driver, DriverId, DriverStatus, OverlapKind, ResolutionAction, ResolutionType,
    Role, RouteId, ScheduleStatus, Topic, VehicleId,
};
use fleet_dispatch::services::DispatchError;
use support::{at, dispatch, service_date, trip};

#[tokio::test]
async fn test_double_booked_driver_is_rejected() {
    let (repo, service, _) = dispatch();
    let s1 = service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();

    let err = service
        .create_schedule(trip(1, "V2", at(9, 0), at(11, 0)))
        .await
        .unwrap_err();

    let conflict = err.as_conflict().expect("conflict error");
    assert_eq!(conflict.conflicting_ids(), vec![s1.id]);
    assert_eq!(conflict.kinds(), vec![OverlapKind::Driver]);
    assert_eq!(repo.schedule_count(), 1);
    assert_eq!(service.open_conflicts().len(), 1);
}

#[tokio::test]
async fn test_shared_driver_and_vehicle_reports_both_kinds() {
    let (_repo, service, _) = dispatch();
    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();

    let err = service
        .create_schedule(trip(1, "V1", at(9, 0), at(11, 0)))
        .await
        .unwrap_err();
    let conflict = err.as_conflict().unwrap();
    assert_eq!(
        conflict.conflicting[0].kinds,
        vec![OverlapKind::Driver, OverlapKind::Vehicle]
    );
}

#[tokio::test]
async fn test_buffer_boundary_is_exclusive() {
    let (_repo, service, _) = dispatch();
    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();

    // 30 minutes after arrival is exactly the buffer edge.
    let next = service.create_schedule(trip(1, "V1", at(10, 30), at(12, 0))).await;
    assert!(next.is_ok());

    let inside = service.create_schedule(trip(1, "V2", at(12, 20), at(13, 0))).await;
    assert!(inside.unwrap_err().as_conflict().is_some());
}

#[tokio::test]
async fn test_detection_has_no_side_effects() {
    let (repo, service, _) = dispatch();
    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();
    let candidate = trip(1, "V2", at(9, 0), at(11, 0));

    let first = service.detect_conflicts(&candidate).await.unwrap();
    let second = service.detect_conflicts(&candidate).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(repo.schedule_count(), 1);
    assert!(service.open_conflicts().is_empty());
}

#[tokio::test]
async fn test_reassign_resolution_notifies_dispatchers_and_drivers() {
    let (repo, service, notifier) = dispatch();
    repo.insert_driver(Driver::new(1, "Ana", DriverStatus::Available));
    repo.insert_driver(Driver::new(2, "Ben", DriverStatus::Available));
    let mut dispatcher = notifier.connect("dispatch-desk", Role::Dispatcher, []);
    let mut ben = notifier.connect("ben", Role::Driver, [Topic::Driver(DriverId(2))]);

    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();
    let conflict_id = service
        .create_schedule(trip(1, "V2", at(9, 0), at(11, 0)))
        .await
        .unwrap_err()
        .as_conflict()
        .unwrap()
        .conflict_id;

    let options = service.generate_resolution_options(conflict_id).await.unwrap();
    assert_eq!(
        options[0].action,
        ResolutionAction::ReassignDriver { driver_id: DriverId(2) }
    );

    let written = service.apply_resolution(conflict_id, &options[0]).await.unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].driver_id, DriverId(2));
    assert_eq!(written[0].vehicle_id, VehicleId::new("V2"));
    assert_eq!(repo.schedule_count(), 2);
    assert!(service
        .detect_conflicts(&written[0].to_candidate())
        .await
        .unwrap()
        .is_empty());
    assert!(service.conflict(conflict_id).unwrap().is_resolved());

    let names: Vec<&str> = dispatcher.drain().iter().map(|n| n.event.name()).collect();
    assert_eq!(
        names,
        vec!["scheduleUpdate", "scheduleConflict", "conflictResolved", "scheduleUpdate"]
    );
    let resolved = ben
        .drain()
        .into_iter()
        .find_map(|n| match n.event {
            DispatchEvent::ConflictResolved { conflict_id, schedules } => Some((conflict_id, schedules)),
            _ => None,
        })
        .expect("driver 2 is told about the resolution");
    assert_eq!(resolved, (conflict_id, vec![written[0].id]));

    assert!(service
        .generate_resolution_options(conflict_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_swap_resolves_committed_conflict() {
    let (repo, service, _) = dispatch();
    let s5 = repo.seed_schedule(&trip(1, "V5", at(7, 0), at(8, 45)), ScheduleStatus::Scheduled);
    let s3 = repo.seed_schedule(&trip(1, "V1", at(9, 0), at(11, 0)), ScheduleStatus::Scheduled);
    let s4 = repo.seed_schedule(&trip(2, "V2", at(9, 30), at(11, 30)), ScheduleStatus::Scheduled);

    let conflicts = service.scan_conflicts(service_date()).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.candidate.id, Some(s3.id));
    assert_eq!(conflict.conflicting, vec![s5.id]);
    assert!(repo.get_schedule(s3.id).await.unwrap().has_conflict);
    assert!(repo.get_schedule(s5.id).await.unwrap().has_conflict);

    let options = service.generate_resolution_options(conflict.id).await.unwrap();
    let swap = options
        .iter()
        .find(|o| o.kind() == ResolutionType::Swap)
        .expect("swap option");
    assert_eq!(swap.action, ResolutionAction::Swap { target_schedule_id: s4.id });

    let written = service.apply_resolution(conflict.id, swap).await.unwrap();
    assert_eq!(written.len(), 2);

    let s3_after = repo.get_schedule(s3.id).await.unwrap();
    let s4_after = repo.get_schedule(s4.id).await.unwrap();
    assert_eq!((s3_after.driver_id, s3_after.vehicle_id.clone()), (DriverId(2), VehicleId::new("V2")));
    assert_eq!((s4_after.driver_id, s4_after.vehicle_id.clone()), (DriverId(1), VehicleId::new("V1")));
    assert_eq!(s3_after.departure, at(9, 0));
    assert!(!s3_after.has_conflict);
    assert!(!s4_after.has_conflict);
    assert!(!repo.get_schedule(s5.id).await.unwrap().has_conflict);

    assert!(service.scan_conflicts(service_date()).await.unwrap().is_empty());
    assert!(service.open_conflicts().is_empty());
}

#[tokio::test]
async fn test_rescan_after_cancellation_clears_conflict() {
    let (repo, service, _) = dispatch();
    let s5 = repo.seed_schedule(&trip(1, "V5", at(7, 0), at(8, 45)), ScheduleStatus::Scheduled);
    let s3 = repo.seed_schedule(&trip(1, "V1", at(9, 0), at(11, 0)), ScheduleStatus::Scheduled);
    let conflict = service.scan_conflicts(service_date()).await.unwrap().remove(0);
    assert!(repo.get_schedule(s3.id).await.unwrap().has_conflict);

    service.cancel_schedule(s5.id).await.unwrap();

    assert!(service.scan_conflicts(service_date()).await.unwrap().is_empty());
    assert!(!repo.get_schedule(s3.id).await.unwrap().has_conflict);
    assert!(service.open_conflicts().is_empty());
    assert!(service.conflict(conflict.id).unwrap().is_dismissed());
    let report = service.analyze_risks_as_of(service_date()).await.unwrap();
    assert_eq!(report.metrics.prevention_rate, 100.0);
}

#[tokio::test]
async fn test_options_for_conflict_that_stopped_holding_are_empty() {
    let (repo, service, _) = dispatch();
    repo.insert_driver(Driver::new(2, "Ben", DriverStatus::Available));
    let s5 = repo.seed_schedule(&trip(1, "V5", at(7, 0), at(8, 45)), ScheduleStatus::Scheduled);
    let s3 = repo.seed_schedule(&trip(1, "V1", at(9, 0), at(11, 0)), ScheduleStatus::Scheduled);
    let conflict = service.scan_conflicts(service_date()).await.unwrap().remove(0);

    service.cancel_schedule(s5.id).await.unwrap();

    assert!(service
        .generate_resolution_options(conflict.id)
        .await
        .unwrap()
        .is_empty());
    assert!(service.conflict(conflict.id).unwrap().is_dismissed());
    assert!(!repo.get_schedule(s3.id).await.unwrap().has_conflict);
    assert!(service.open_conflicts().is_empty());
}

#[tokio::test]
async fn test_departed_subject_gets_no_options() {
    let (repo, service, _) = dispatch();
    repo.insert_driver(Driver::new(2, "Ben", DriverStatus::Available));
    repo.seed_schedule(&trip(1, "V5", at(7, 0), at(8, 45)), ScheduleStatus::Scheduled);
    let s3 = repo.seed_schedule(&trip(1, "V1", at(9, 0), at(11, 0)), ScheduleStatus::Scheduled);
    let conflict = service.scan_conflicts(service_date()).await.unwrap().remove(0);
    assert!(!service.generate_resolution_options(conflict.id).await.unwrap().is_empty());

    service.start_schedule(s3.id).await.unwrap();

    assert!(service
        .generate_resolution_options(conflict.id)
        .await
        .unwrap()
        .is_empty());
    assert!(!service.conflict(conflict.id).unwrap().is_resolved());
}

#[tokio::test]
async fn test_repeated_rejection_keeps_one_open_conflict() {
    let (repo, service, _) = dispatch();
    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..20 {
        let err = service
            .create_schedule(trip(1, "V2", at(9, 0), at(11, 0)))
            .await
            .unwrap_err();
        ids.push(err.as_conflict().unwrap().conflict_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(service.open_conflicts().len(), 1);
    assert_eq!(
        repo.count_conflicts(RouteId(1), DriverId(1), service_date()).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_failed_swap_changes_nothing_and_can_be_retried() {
    let (repo, service, _) = dispatch();
    repo.seed_schedule(&trip(1, "V5", at(7, 0), at(8, 45)), ScheduleStatus::Scheduled);
    let s3 = repo.seed_schedule(&trip(1, "V1", at(9, 0), at(11, 0)), ScheduleStatus::Scheduled);
    let s4 = repo.seed_schedule(&trip(2, "V2", at(9, 30), at(11, 30)), ScheduleStatus::Scheduled);
    let conflict = service.scan_conflicts(service_date()).await.unwrap().remove(0);
    let swap = service
        .generate_resolution_options(conflict.id)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.kind() == ResolutionType::Swap)
        .unwrap();

    repo.fail_after_writes(1);
    let err = service.apply_resolution(conflict.id, &swap).await.unwrap_err();
    assert!(matches!(err, DispatchError::ExecutionFailed(_)));
    let s3_now = repo.get_schedule(s3.id).await.unwrap();
    let s4_now = repo.get_schedule(s4.id).await.unwrap();
    assert_eq!(s3_now.driver_id, DriverId(1));
    assert_eq!(s4_now.driver_id, DriverId(2));
    assert!(!service.conflict(conflict.id).unwrap().is_resolved());

    service.apply_resolution(conflict.id, &swap).await.unwrap();
    assert_eq!(repo.get_schedule(s3.id).await.unwrap().driver_id, DriverId(2));
    assert_eq!(repo.get_schedule(s4.id).await.unwrap().driver_id, DriverId(1));
}

#[tokio::test]
async fn test_option_invalidated_by_new_booking_is_stale() {
    let (repo, service, _) = dispatch();
    repo.insert_driver(Driver::new(2, "Ben", DriverStatus::Available));
    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();
    let conflict_id = service
        .create_schedule(trip(1, "V2", at(9, 0), at(11, 0)))
        .await
        .unwrap_err()
        .as_conflict()
        .unwrap()
        .conflict_id;
    let options = service.generate_resolution_options(conflict_id).await.unwrap();
    let reassign = options
        .iter()
        .find(|o| o.kind() == ResolutionType::ReassignDriver)
        .unwrap();

    let blocker = service.create_schedule(trip(2, "V9", at(9, 30), at(10, 30))).await.unwrap();

    match service.apply_resolution(conflict_id, reassign).await {
        Err(DispatchError::StaleOption(stale)) => assert_eq!(stale.conflicting, vec![blocker.id]),
        other => panic!("expected stale option, got {other:?}"),
    }
    assert_eq!(repo.schedule_count(), 2);
    assert!(!service.conflict(conflict_id).unwrap().is_resolved());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bookings_for_one_driver_admit_exactly_one() {
    let (repo, service, _) = dispatch();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .create_schedule(trip(1, &format!("V{}", i), at(9, 0), at(11, 0)))
                    .await
            })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    let mut created = 0;
    let mut rejected = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => created += 1,
            Err(DispatchError::Conflict(_)) => rejected += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(rejected, 7);
    assert_eq!(repo.schedule_count(), 1);
}

#[tokio::test]
async fn test_status_lifecycle_and_invalid_transition() {
    let (_repo, service, _) = dispatch();
    let s1 = service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();

    let err = service.complete_schedule(s1.id, at(10, 5)).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::InvalidTransition {
            from: ScheduleStatus::Scheduled,
            to: ScheduleStatus::Completed,
            ..
        }
    ));

    service.start_schedule(s1.id).await.unwrap();
    let done = service.complete_schedule(s1.id, at(10, 5)).await.unwrap();
    assert_eq!(done.status, ScheduleStatus::Completed);
    assert_eq!(done.actual_arrival, Some(at(10, 5)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolutions_cannot_double_book_a_driver() {
    let (repo, service, _) = dispatch();
    for (id, name) in [(1, "Ana"), (2, "Ben"), (3, "Cy")] {
        repo.insert_driver(Driver::new(id, name, DriverStatus::Available));
    }
    service.create_schedule(trip(1, "V1", at(8, 0), at(10, 0))).await.unwrap();
    service.create_schedule(trip(3, "V3", at(8, 0), at(10, 0))).await.unwrap();

    let mut pending = Vec::new();
    for (driver, vehicle) in [(1, "V2"), (3, "V4")] {
        let conflict_id = service
            .create_schedule(trip(driver, vehicle, at(9, 0), at(11, 0)))
            .await
            .unwrap_err()
            .as_conflict()
            .unwrap()
            .conflict_id;
        let to_ben = service
            .generate_resolution_options(conflict_id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.action == ResolutionAction::ReassignDriver { driver_id: DriverId(2) })
            .expect("driver 2 is free for both trips");
        pending.push((conflict_id, to_ben));
    }

    let handles: Vec<_> = pending
        .into_iter()
        .map(|(conflict_id, option)| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.apply_resolution(conflict_id, &option).await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    let mut applied = 0;
    let mut stale = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => applied += 1,
            Err(DispatchError::StaleOption(_)) => stale += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((applied, stale), (1, 1));
    assert_eq!(repo.schedule_count(), 3);
    assert_eq!(service.open_conflicts().len(), 1);
}
