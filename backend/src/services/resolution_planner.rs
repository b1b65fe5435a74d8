//! Builds ranked remediation options for a conflict.
//!
//! Three strategies are tried against the conflict's non-primary side:
//! hand the trip to another available driver, move it to a nearby slot on
//! the same day, or exchange assignments with another trip that day. Every
//! option is re-checked against the current calendar before it is offered,
//! so each returned option would be conflict-free if applied right now.

use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;

use super::calendar::ResourceCalendar;
use super::conflict_detector::ConflictDetector;
use crate::config::ResolutionSettings;
use crate::db::RepositoryResult;
use crate::models::{
    Conflict, ImpactLevel, ResolutionAction, ResolutionOption, Schedule, ScheduleCandidate,
    ScheduleFilter, ScheduleId, SchedulePatch, ScheduleStatus,
};

const REASSIGN_DISRUPTION: u32 = 10;
const RESCHEDULE_DISRUPTION_PER_STEP: u32 = 10;
const RESCHEDULE_BASE_DISRUPTION: u32 = 5;
const SWAP_DISRUPTION: u32 = 25;

pub struct ResolutionPlanner {
    calendar: Arc<ResourceCalendar>,
    detector: Arc<ConflictDetector>,
    step: Duration,
    max_steps: u32,
}

impl ResolutionPlanner {
    pub fn new(calendar: Arc<ResourceCalendar>, detector: Arc<ConflictDetector>, settings: &ResolutionSettings) -> Self {
        Self {
            calendar,
            detector,
            step: Duration::minutes(settings.reschedule_step_minutes),
            max_steps: settings.reschedule_max_steps,
        }
    }

    /// Options for `conflict`, least disruptive first. Empty when nothing
    /// fits or the subject is no longer scheduled; that is not an error.
    pub async fn plan(&self, conflict: &Conflict) -> RepositoryResult<Vec<ResolutionOption>> {
        let Some(subject) = self.current_subject(conflict).await? else {
            log::debug!("Conflict {}: subject is no longer scheduled", conflict.id);
            return Ok(Vec::new());
        };

        let mut options = self.reassign_options(&subject).await?;
        options.extend(self.reschedule_options(&subject).await?);
        options.extend(self.swap_options(conflict, &subject).await?);

        // Stable: equal disruption keeps generation order.
        options.sort_by_key(|o| o.disruption);
        log::debug!(
            "Conflict {}: {} resolution option(s)",
            conflict.id,
            options.len()
        );
        Ok(options)
    }

    /// The subject as it is now. Committed subjects are re-read since their
    /// record may have moved since detection; `None` once the record is gone
    /// or has left the scheduled state.
    async fn current_subject(&self, conflict: &Conflict) -> RepositoryResult<Option<ScheduleCandidate>> {
        let Some(id) = conflict.candidate.id else {
            return Ok(Some(conflict.candidate.clone()));
        };
        match self.calendar.get(id).await {
            Ok(record) if record.status == ScheduleStatus::Scheduled => Ok(Some(record.to_candidate())),
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn reassign_options(&self, subject: &ScheduleCandidate) -> RepositoryResult<Vec<ResolutionOption>> {
        let drivers = self.calendar.repository().list_drivers().await?;
        let mut options = Vec::new();
        for driver in drivers
            .into_iter()
            .filter(|d| d.is_available() && d.id != subject.driver_id)
        {
            let moved = subject.with_patch(&SchedulePatch::reassign_driver(driver.id));
            if !self.detector.detect(&moved).await?.is_empty() {
                continue;
            }
            options.push(ResolutionOption {
                action: ResolutionAction::ReassignDriver { driver_id: driver.id },
                impact: ImpactLevel::Low,
                title: format!("Reassign to {}", driver.name),
                description: format!(
                    "Driver {} is free between {} and {}",
                    driver.name,
                    subject.departure.format("%H:%M"),
                    subject.estimated_arrival.format("%H:%M")
                ),
                disruption: REASSIGN_DISRUPTION,
            });
        }
        Ok(options)
    }

    async fn reschedule_options(&self, subject: &ScheduleCandidate) -> RepositoryResult<Vec<ResolutionOption>> {
        let duration = self.calendar.trip_duration(subject).await?;
        let mut options = Vec::new();
        for steps in step_sequence(self.max_steps) {
            let offset = self.step * steps;
            let departure = subject.departure + offset;
            let arrival = departure + duration;
            if departure.date() != subject.service_date || arrival.date() != subject.service_date {
                continue;
            }
            let moved = subject.with_patch(&SchedulePatch::retime(departure, arrival));
            if !self.detector.detect(&moved).await?.is_empty() {
                continue;
            }
            options.push(reschedule_option(subject.departure, departure, arrival, steps));
        }
        Ok(options)
    }

    async fn swap_options(&self, conflict: &Conflict, subject: &ScheduleCandidate) -> RepositoryResult<Vec<ResolutionOption>> {
        let filter = ScheduleFilter::on_date(subject.service_date).with_statuses(&[ScheduleStatus::Scheduled]);
        let same_day = self.calendar.list(&filter).await?;
        let mut options = Vec::new();
        for target in same_day {
            if conflict.involves(target.id) || Some(target.id) == subject.id {
                continue;
            }
            if target.driver_id == subject.driver_id && target.vehicle_id == subject.vehicle_id {
                continue;
            }
            if self.swap_is_clean(subject, &target).await? {
                options.push(ResolutionOption {
                    action: ResolutionAction::Swap { target_schedule_id: target.id },
                    impact: ImpactLevel::Medium,
                    title: format!("Swap with schedule {}", target.id),
                    description: format!(
                        "Exchange driver and vehicle with the {} departure (driver {}, vehicle {})",
                        target.departure.format("%H:%M"),
                        target.driver_id,
                        target.vehicle_id
                    ),
                    disruption: SWAP_DISRUPTION,
                });
            }
        }
        Ok(options)
    }

    /// Both sides of the exchange must be free of conflicts, including
    /// against each other.
    pub async fn swap_is_clean(&self, subject: &ScheduleCandidate, target: &Schedule) -> RepositoryResult<bool> {
        let (subject_after, target_after) = swapped(subject, target);
        let mut exclude: Vec<ScheduleId> = vec![target.id];
        exclude.extend(subject.id);

        if !self.detector.detect_excluding(&subject_after, &exclude).await?.is_empty() {
            return Ok(false);
        }
        if !self.detector.detect_excluding(&target_after, &exclude).await?.is_empty() {
            return Ok(false);
        }
        Ok(!self.detector.collides(&subject_after, &target_after)
            && !self.detector.collides(&target_after, &subject_after))
    }
}

/// The two assignments after exchanging driver and vehicle.
pub fn swapped(subject: &ScheduleCandidate, target: &Schedule) -> (ScheduleCandidate, ScheduleCandidate) {
    let subject_after = subject.with_patch(&SchedulePatch::assignment(target.driver_id, target.vehicle_id.clone()));
    let target_after = target
        .to_candidate()
        .with_patch(&SchedulePatch::assignment(subject.driver_id, subject.vehicle_id.clone()));
    (subject_after, target_after)
}

/// -1, +1, -2, +2, ... up to `max_steps` either way.
fn step_sequence(max_steps: u32) -> impl Iterator<Item = i32> {
    (1..=max_steps as i32).flat_map(|k| [-k, k])
}

fn reschedule_option(
    original: NaiveDateTime,
    departure: NaiveDateTime,
    arrival: NaiveDateTime,
    steps: i32,
) -> ResolutionOption {
    let distance = steps.unsigned_abs();
    let impact = match distance {
        0 | 1 => ImpactLevel::Low,
        2 => ImpactLevel::Medium,
        _ => ImpactLevel::High,
    };
    let offset_minutes = (departure - original).num_minutes();
    let direction = if offset_minutes < 0 { "earlier" } else { "later" };
    ResolutionOption {
        action: ResolutionAction::Reschedule {
            departure,
            estimated_arrival: arrival,
            offset_minutes,
        },
        impact,
        title: format!("Reschedule to {}", departure.format("%H:%M")),
        description: format!(
            "Depart {} minutes {} and arrive at {}",
            offset_minutes.abs(),
            direction,
            arrival.format("%H:%M")
        ),
        disruption: RESCHEDULE_BASE_DISRUPTION + RESCHEDULE_DISRUPTION_PER_STEP * distance,
    }
}
