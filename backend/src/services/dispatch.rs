//! Dispatch facade: the operations exposed to booking and dispatcher flows.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use fleet_dispatch::config::DispatchConfig;
//! use fleet_dispatch::db::LocalRepository;
//! use fleet_dispatch::services::DispatchService;
//!
//! let (service, notifier) = DispatchService::with_notifier(
//!     Arc::new(LocalRepository::new()),
//!     DispatchConfig::default(),
//! );
//! assert!(service.open_conflicts().is_empty());
//! assert_eq!(notifier.active_sessions(), 0);
//! ```

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::calendar::ResourceCalendar;
use super::conflict_detector::ConflictDetector;
use super::conflict_registry::ConflictRegistry;
use super::error::{ConflictError, DispatchError, DispatchResult};
use super::locks::LockKey;
use super::notifier::{conflict_topics, resolved_topics, update_topics, EventPublisher, Notifier};
use super::resolution_executor::ResolutionExecutor;
use super::resolution_planner::ResolutionPlanner;
use super::risk_analyzer::{RiskAnalyzer, RiskMonitor};
use crate::config::DispatchConfig;
use crate::db::FullRepository;
use crate::models::{
    Conflict, ConflictId, ConflictRecord, ConflictingSchedule, DispatchEvent, ResolutionOption,
    RiskReport, Schedule, ScheduleCandidate, ScheduleFilter, ScheduleId, SchedulePatch,
    ScheduleStatus,
};

pub struct DispatchService {
    config: DispatchConfig,
    calendar: Arc<ResourceCalendar>,
    detector: Arc<ConflictDetector>,
    registry: Arc<ConflictRegistry>,
    planner: ResolutionPlanner,
    executor: ResolutionExecutor,
    analyzer: Arc<RiskAnalyzer>,
    publisher: Arc<dyn EventPublisher>,
}

impl DispatchService {
    pub fn new(repo: Arc<dyn FullRepository>, config: DispatchConfig, publisher: Arc<dyn EventPublisher>) -> Self {
        let calendar = Arc::new(ResourceCalendar::new(repo));
        let analyzer = Arc::new(RiskAnalyzer::new(calendar.clone(), config.risk.clone()));
        Self::assemble(calendar, analyzer, config, publisher)
    }

    /// Service publishing to a fresh in-process [`Notifier`].
    pub fn with_notifier(repo: Arc<dyn FullRepository>, config: DispatchConfig) -> (Self, Arc<Notifier>) {
        let notifier = Arc::new(Notifier::new(config.notifier.session_queue_capacity));
        (Self::new(repo, config, notifier.clone()), notifier)
    }

    fn assemble(
        calendar: Arc<ResourceCalendar>,
        analyzer: Arc<RiskAnalyzer>,
        config: DispatchConfig,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let detector = Arc::new(ConflictDetector::new(calendar.clone(), config.overlap_buffer()));
        let registry = Arc::new(ConflictRegistry::new());
        let planner = ResolutionPlanner::new(calendar.clone(), detector.clone(), &config.resolution);
        let executor = ResolutionExecutor::new(calendar.clone(), detector.clone(), registry.clone());
        Self {
            config,
            calendar,
            detector,
            registry,
            planner,
            executor,
            analyzer,
            publisher,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn calendar(&self) -> &Arc<ResourceCalendar> {
        &self.calendar
    }

    pub fn risk_analyzer(&self) -> &Arc<RiskAnalyzer> {
        &self.analyzer
    }

    /// Commit `candidate` unless it overlaps an active schedule sharing its
    /// driver or vehicle.
    ///
    /// Detection and insert run under the candidate's (driver, date) and
    /// (vehicle, date) keys, so two concurrent writes for the same resource
    /// cannot both pass.
    ///
    /// # Returns
    /// * `Err(DispatchError::Conflict)` with the conflicting records and a
    ///   registered conflict id when rejected
    /// * `Err(DispatchError::InvalidCandidate)` for malformed input
    pub async fn create_schedule(&self, mut candidate: ScheduleCandidate) -> DispatchResult<Schedule> {
        candidate.validate().map_err(DispatchError::InvalidCandidate)?;
        candidate.id = None;

        let guard = self.calendar.lock(LockKey::for_candidate(&candidate)).await;
        let overlaps = self.detector.detect(&candidate).await?;
        if !overlaps.is_empty() {
            drop(guard);
            return Err(self.reject(candidate, overlaps).await);
        }
        let schedule = self.calendar.insert(&guard, candidate).await?;
        drop(guard);

        log::debug!(
            "Created schedule {} for driver {} on {}",
            schedule.id,
            schedule.driver_id,
            schedule.service_date
        );
        self.publish_update(&schedule);
        Ok(schedule)
    }

    async fn reject(&self, candidate: ScheduleCandidate, overlaps: Vec<ConflictingSchedule>) -> DispatchError {
        let (conflict, created) = self.registry.register(candidate.clone(), &overlaps);
        log::info!(
            "Rejected schedule for driver {} / vehicle {} on {}: conflict {} with {:?}",
            candidate.driver_id,
            candidate.vehicle_id,
            candidate.service_date,
            conflict.id,
            conflict.conflicting
        );
        if created {
            self.audit_conflict(&conflict).await;
        }
        self.publish_conflicts(&candidate, &overlaps);

        ConflictError {
            conflict_id: conflict.id,
            candidate,
            conflicting: overlaps,
        }
        .into()
    }

    /// Committed schedules `candidate` would overlap. No side effects.
    pub async fn detect_conflicts(&self, candidate: &ScheduleCandidate) -> DispatchResult<Vec<Schedule>> {
        Ok(self
            .detector
            .detect(candidate)
            .await?
            .into_iter()
            .map(|c| c.schedule)
            .collect())
    }

    /// Like [`detect_conflicts`](Self::detect_conflicts), with the shared
    /// resources of each overlap.
    pub async fn detect_conflict_details(&self, candidate: &ScheduleCandidate) -> DispatchResult<Vec<ConflictingSchedule>> {
        Ok(self.detector.detect(candidate).await?)
    }

    /// Find and register conflicts among records already committed on `date`.
    ///
    /// Open conflicts on `date` that no longer hold are dismissed, and the
    /// conflict flag of every record on `date` is brought in line with the
    /// conflicts still open.
    pub async fn scan_conflicts(&self, date: NaiveDate) -> DispatchResult<Vec<Conflict>> {
        let found = self.detector.scan(date).await?;
        let mut conflicts = Vec::with_capacity(found.len());

        for committed in found {
            let candidate = committed.subject.to_candidate();
            let (conflict, created) = self.registry.register(candidate.clone(), &committed.primaries);
            if created {
                self.audit_conflict(&conflict).await;
                self.publish_conflicts(&candidate, &committed.primaries);
            }
            conflicts.push(conflict);
        }

        let subjects: HashSet<ScheduleId> = conflicts.iter().filter_map(|c| c.candidate.id).collect();
        for open in self.registry.open() {
            if open.candidate.service_date != date {
                continue;
            }
            let holds = match open.candidate.id {
                Some(id) => subjects.contains(&id),
                None => !self.detector.detect(&open.candidate).await?.is_empty(),
            };
            if !holds {
                self.dismiss(&open);
            }
        }

        let on_date = self.calendar.list(&ScheduleFilter::on_date(date)).await?;
        let flags: Vec<(ScheduleId, bool)> = on_date
            .iter()
            .map(|s| (s.id, s.has_conflict, !self.registry.open_involving(s.id).is_empty()))
            .filter(|(_, current, wanted)| current != wanted)
            .map(|(id, _, wanted)| (id, wanted))
            .collect();
        self.calendar.mark_conflicts(&flags).await?;
        Ok(conflicts)
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> DispatchResult<Conflict> {
        self.registry
            .get(conflict_id)
            .ok_or(DispatchError::ConflictNotFound(conflict_id))
    }

    pub fn open_conflicts(&self) -> Vec<Conflict> {
        self.registry.open()
    }

    pub async fn analyze_risks(&self) -> DispatchResult<Arc<RiskReport>> {
        Ok(self.analyzer.analyze().await?)
    }

    pub async fn analyze_risks_as_of(&self, as_of: NaiveDate) -> DispatchResult<Arc<RiskReport>> {
        Ok(self.analyzer.analyze_as_of(as_of).await?)
    }

    /// Start refreshing the risk report every `risk.refresh_interval_secs`.
    pub fn spawn_risk_monitor(&self) -> JoinHandle<()> {
        RiskMonitor::spawn(self.analyzer.clone(), self.config.refresh_interval())
    }

    /// Ranked options for an open conflict; empty once it is resolved.
    pub async fn generate_resolution_options(&self, conflict_id: ConflictId) -> DispatchResult<Vec<ResolutionOption>> {
        let conflict = self.conflict(conflict_id)?;
        if conflict.is_resolved() {
            log::debug!("Conflict {} already resolved, no options", conflict_id);
            return Ok(Vec::new());
        }
        if !self.still_holds(&conflict).await? {
            self.dismiss(&conflict);
            self.refresh_flags(&conflict).await?;
            return Ok(Vec::new());
        }
        Ok(self.planner.plan(&conflict).await?)
    }

    /// Whether the subject of `conflict` still overlaps an active schedule.
    /// A committed subject that was removed or left the active states no
    /// longer conflicts with anything.
    async fn still_holds(&self, conflict: &Conflict) -> DispatchResult<bool> {
        let subject = match conflict.candidate.id {
            Some(id) => match self.calendar.get(id).await {
                Ok(record) if matches!(record.status, ScheduleStatus::Scheduled | ScheduleStatus::InProgress) => {
                    record.to_candidate()
                }
                Ok(_) => return Ok(false),
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e.into()),
            },
            None => conflict.candidate.clone(),
        };
        Ok(!self.detector.detect(&subject).await?.is_empty())
    }

    fn dismiss(&self, conflict: &Conflict) {
        if self.registry.dismiss(conflict.id).is_some() {
            log::info!("Conflict {} no longer holds, dismissed", conflict.id);
        }
    }

    /// Records of `conflict` keep their flag only while another open
    /// conflict involves them.
    async fn refresh_flags(&self, conflict: &Conflict) -> DispatchResult<()> {
        let flags: Vec<(ScheduleId, bool)> = conflict
            .schedule_ids()
            .into_iter()
            .map(|id| (id, !self.registry.open_involving(id).is_empty()))
            .collect();
        Ok(self.calendar.mark_conflicts(&flags).await?)
    }

    /// Apply `option` atomically and notify everyone affected.
    ///
    /// # Returns
    /// * `Err(DispatchError::StaleOption)` if the option no longer fits the
    ///   calendar; nothing was changed
    /// * `Err(DispatchError::ExecutionFailed)` if the atomic write failed and
    ///   was rolled back
    pub async fn apply_resolution(&self, conflict_id: ConflictId, option: &ResolutionOption) -> DispatchResult<Vec<Schedule>> {
        let applied = match self.executor.apply(conflict_id, option).await {
            Ok(applied) => applied,
            Err(e) => {
                if e.is_stale() {
                    log::warn!("Resolution of conflict {} rejected: {}", conflict_id, e);
                }
                return Err(e);
            }
        };

        self.publisher.publish_to(
            &resolved_topics(applied.affected_drivers()),
            &DispatchEvent::ConflictResolved {
                conflict_id,
                schedules: applied.schedule_ids(),
            },
        );
        for schedule in &applied.schedules {
            self.publish_update(schedule);
        }
        Ok(applied.schedules)
    }

    pub async fn start_schedule(&self, schedule_id: ScheduleId) -> DispatchResult<Schedule> {
        self.transition(schedule_id, ScheduleStatus::InProgress, None).await
    }

    pub async fn complete_schedule(&self, schedule_id: ScheduleId, actual_arrival: NaiveDateTime) -> DispatchResult<Schedule> {
        self.transition(schedule_id, ScheduleStatus::Completed, Some(actual_arrival))
            .await
    }

    pub async fn cancel_schedule(&self, schedule_id: ScheduleId) -> DispatchResult<Schedule> {
        self.transition(schedule_id, ScheduleStatus::Cancelled, None).await
    }

    async fn transition(
        &self,
        schedule_id: ScheduleId,
        next: ScheduleStatus,
        actual_arrival: Option<NaiveDateTime>,
    ) -> DispatchResult<Schedule> {
        // A resolution may move the record between the read and the lock.
        let (guard, current) = loop {
            let seen = self.calendar.get(schedule_id).await?;
            let guard = self.calendar.lock(LockKey::for_schedule(&seen)).await;
            let current = self.calendar.get(schedule_id).await?;
            if LockKey::for_schedule(&current) == LockKey::for_schedule(&seen) {
                break (guard, current);
            }
        };
        if !current.status.can_transition_to(next) {
            return Err(DispatchError::InvalidTransition {
                schedule_id,
                from: current.status,
                to: next,
            });
        }

        let mut patch = SchedulePatch::status(next);
        patch.actual_arrival = actual_arrival;
        let mut updated = self.calendar.update_many(&guard, vec![(schedule_id, patch)]).await?;
        drop(guard);

        let schedule = updated
            .pop()
            .ok_or_else(|| crate::db::RepositoryError::internal("status update returned no record"))?;
        log::info!("Schedule {} is now {}", schedule.id, schedule.status);
        self.publish_update(&schedule);
        Ok(schedule)
    }

    async fn audit_conflict(&self, conflict: &Conflict) {
        if let Err(e) = self
            .calendar
            .repository()
            .record_conflict(ConflictRecord::from(conflict))
            .await
        {
            log::warn!("Failed to record conflict {}: {}", conflict.id, e);
        }
    }

    fn publish_conflicts(&self, candidate: &ScheduleCandidate, overlaps: &[ConflictingSchedule]) {
        let topics = conflict_topics(candidate.driver_id);
        for overlap in overlaps {
            self.publisher.publish_to(
                &topics,
                &DispatchEvent::ScheduleConflict {
                    driver_id: candidate.driver_id,
                    date: candidate.service_date,
                    conflicting_schedule: overlap.schedule.clone(),
                },
            );
        }
    }

    fn publish_update(&self, schedule: &Schedule) {
        self.publisher.publish_to(
            &update_topics(schedule),
            &DispatchEvent::ScheduleUpdate {
                schedule: schedule.clone(),
            },
        );
    }
}
