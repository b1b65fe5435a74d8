//! Service layer for conflict prevention and resolution.
//!
//! Services sit between the repository traits and the callers (booking and
//! dispatcher flows). They own detection, per-resource write serialization,
//! planning and applying resolutions, risk analysis and event publishing.
//!
//! - [`calendar`]: Keyed writes over the schedule store
//! - [`conflict_detector`]: Overlap detection for candidates and committed records
//! - [`resolution_planner`] / [`resolution_executor`]: Remediation options and their atomic application
//! - [`risk_analyzer`]: Cached risk reports built from [`risk_detectors`]
//! - [`notifier`]: Topic-addressed push delivery
//! - [`dispatch`]: The facade tying them together

pub mod calendar;
pub mod conflict_detector;
pub mod conflict_registry;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod notifier;
pub mod resolution_executor;
pub mod resolution_planner;
pub mod risk_analyzer;
pub mod risk_detectors;

pub use calendar::ResourceCalendar;
pub use conflict_detector::{CommittedConflict, ConflictDetector};
pub use conflict_registry::ConflictRegistry;
pub use dispatch::DispatchService;
pub use error::{ConflictError, DispatchError, DispatchResult, StaleOptionError};
pub use locks::{KeyGuard, KeyLocks, LockKey};
pub use notifier::{EventPublisher, NoopPublisher, Notification, Notifier, Session, SessionId};
pub use resolution_executor::{AppliedResolution, ResolutionExecutor};
pub use resolution_planner::ResolutionPlanner;
pub use risk_analyzer::{RiskAnalyzer, RiskMonitor};
pub use risk_detectors::{PatternDetector, RiskContext, RiskFactorCheck};
