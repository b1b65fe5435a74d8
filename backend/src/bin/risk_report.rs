//! Offline risk report.
//!
//! Loads a calendar snapshot into the in-memory repository, flags conflicts
//! among the imported schedules and prints the risk report as JSON.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin risk-report -- snapshot.json [YYYY-MM-DD]
//! ```
//!
//! # Environment Variables
//!
//! - `DISPATCH_CONFIG`: Path to a `dispatch.toml` (default: search path, then built-in defaults)
//! - `RUST_LOG`: Log level (default: info)

use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fleet_dispatch::config::DispatchConfig;
use fleet_dispatch::db::LocalRepository;
use fleet_dispatch::models::{Driver, Route, ScheduleCandidate, ScheduleStatus};
use fleet_dispatch::services::{DispatchService, NoopPublisher};

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    drivers: Vec<Driver>,
    #[serde(default)]
    routes: Vec<Route>,
    schedules: Vec<SnapshotSchedule>,
}

#[derive(Debug, Deserialize)]
struct SnapshotSchedule {
    #[serde(flatten)]
    trip: ScheduleCandidate,
    #[serde(default = "default_status")]
    status: ScheduleStatus,
    #[serde(default)]
    actual_arrival: Option<NaiveDateTime>,
}

fn default_status() -> ScheduleStatus {
    ScheduleStatus::Scheduled
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Level::INFO),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("usage: risk-report <snapshot.json> [YYYY-MM-DD]");
    };
    let as_of = match args.next() {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .with_context(|| format!("invalid report date '{}'", raw))?,
        None => Utc::now().date_naive(),
    };

    let config = DispatchConfig::from_env().context("failed to load dispatch configuration")?;
    let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
    let snapshot: Snapshot = serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path))?;

    let repo = Arc::new(LocalRepository::new());
    for driver in snapshot.drivers {
        repo.insert_driver(driver);
    }
    for route in snapshot.routes {
        repo.insert_route(route);
    }
    let mut dates = BTreeSet::new();
    for entry in &snapshot.schedules {
        entry
            .trip
            .validate()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("invalid schedule in {}", path))?;
        let stored = repo.seed_schedule(&entry.trip, entry.status);
        if let Some(actual) = entry.actual_arrival {
            repo.set_actual_arrival(stored.id, actual);
        }
        dates.insert(stored.service_date);
    }
    info!(
        "Loaded {} schedule(s) across {} date(s)",
        snapshot.schedules.len(),
        dates.len()
    );

    let service = DispatchService::new(repo, config, Arc::new(NoopPublisher));
    let mut conflicts = 0;
    for date in dates {
        conflicts += service.scan_conflicts(date).await?.len();
    }
    info!("Flagged {} conflicting schedule(s)", conflicts);

    let report = service.analyze_risks_as_of(as_of).await?;
    println!("{}", serde_json::to_string_pretty(report.as_ref())?);
    Ok(())
}
