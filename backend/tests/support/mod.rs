#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use fleet_dispatch::config::DispatchConfig;
use fleet_dispatch::db::LocalRepository;
use fleet_dispatch::models::{DriverId, RouteId, ScheduleCandidate, VehicleId};
use fleet_dispatch::services::{DispatchService, Notifier};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Runs `f` with environment variables temporarily modified.
///
/// This is panic-safe (restores variables on unwind) and also serializes access to
/// process-global env vars to avoid flaky tests when Rust runs tests in parallel.
///
/// `changes` is a list of `(key, value)` pairs:
/// - `Some(v)` sets the variable to `v`
/// - `None` removes the variable
pub fn with_scoped_env<F, R>(changes: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _guard = ScopedEnv::new(changes);
    f()
}

struct ScopedEnv {
    snapshot: Vec<(String, Option<String>)>,
}

impl ScopedEnv {
    fn new(changes: &[(&str, Option<&str>)]) -> Self {
        let keys: HashSet<&str> = changes.iter().map(|(k, _)| *k).collect();
        let snapshot = keys
            .into_iter()
            .map(|k| (k.to_string(), std::env::var(k).ok()))
            .collect::<Vec<_>>();

        for (k, v) in changes {
            match v {
                Some(val) => std::env::set_var(k, val),
                None => std::env::remove_var(k),
            }
        }

        Self { snapshot }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        for (k, v) in self.snapshot.drain(..) {
            match v {
                Some(val) => std::env::set_var(&k, val),
                None => std::env::remove_var(&k),
            }
        }
    }
}

pub fn service_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

pub fn day(offset: i64) -> NaiveDate {
    service_date() + chrono::Duration::days(offset)
}

pub fn at(h: u32, m: u32) -> NaiveDateTime {
    service_date().and_hms_opt(h, m, 0).unwrap()
}

pub fn at_on(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    date.and_hms_opt(h, m, 0).unwrap()
}

pub fn trip(driver: i64, vehicle: &str, departure: NaiveDateTime, arrival: NaiveDateTime) -> ScheduleCandidate {
    ScheduleCandidate {
        id: None,
        route_id: RouteId(1),
        service_date: departure.date(),
        departure,
        estimated_arrival: arrival,
        driver_id: DriverId(driver),
        vehicle_id: VehicleId::new(vehicle),
        seat_capacity: 45,
    }
}

pub fn dispatch() -> (Arc<LocalRepository>, Arc<DispatchService>, Arc<Notifier>) {
    let repo = Arc::new(LocalRepository::new());
    let (service, notifier) = DispatchService::with_notifier(repo.clone(), DispatchConfig::default());
    (repo, Arc::new(service), notifier)
}
