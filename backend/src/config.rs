//! Dispatch configuration file support.
//!
//! Every threshold the detector, planner and risk analyzer use is read from
//! here rather than baked into logic. All keys are optional in the TOML file.
//!
//! ```toml
//! [repository]
//! type = "local"
//!
//! [conflict]
//! overlap_buffer_minutes = 30
//!
//! [risk]
//! tight_connection_minutes = 60
//! ```

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::db::RepositoryError;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "DISPATCH_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub repository: RepositorySettings,
    #[serde(default)]
    pub conflict: ConflictSettings,
    #[serde(default)]
    pub resolution: ResolutionSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub notifier: NotifierSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySettings {
    #[serde(rename = "type", default = "default_repo_type")]
    pub repo_type: String,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            repo_type: default_repo_type(),
        }
    }
}

fn default_repo_type() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSettings {
    /// Widens (or, at 0, narrows to the bare trip) what counts as a
    /// conflicting window: trips sharing a driver or vehicle need this much
    /// idle time between them.
    #[serde(default = "default_overlap_buffer_minutes")]
    pub overlap_buffer_minutes: i64,
}

impl Default for ConflictSettings {
    fn default() -> Self {
        Self {
            overlap_buffer_minutes: default_overlap_buffer_minutes(),
        }
    }
}

fn default_overlap_buffer_minutes() -> i64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSettings {
    /// Increment between candidate departure slots.
    #[serde(default = "default_reschedule_step_minutes")]
    pub reschedule_step_minutes: i64,
    /// How many increments to search on each side of the current departure.
    #[serde(default = "default_reschedule_max_steps")]
    pub reschedule_max_steps: u32,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            reschedule_step_minutes: default_reschedule_step_minutes(),
            reschedule_max_steps: default_reschedule_max_steps(),
        }
    }
}

fn default_reschedule_step_minutes() -> i64 {
    60
}

fn default_reschedule_max_steps() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Idle time between consecutive trips of one driver or vehicle below
    /// which the connection counts as tight.
    #[serde(default = "default_tight_connection_minutes")]
    pub tight_connection_minutes: i64,
    /// Planned driving minutes per day above which a driver is at fatigue risk.
    #[serde(default = "default_fatigue_max_daily_minutes")]
    pub fatigue_max_daily_minutes: i64,
    /// Recorded conflicts on a route/driver pair that set the historical factor.
    #[serde(default = "default_historical_conflict_threshold")]
    pub historical_conflict_threshold: usize,
    /// Workload pattern: schedule count must exceed this.
    #[serde(default = "default_workload_min_schedules")]
    pub workload_min_schedules: usize,
    /// Workload pattern: consecutive working days must exceed this.
    #[serde(default = "default_workload_min_consecutive_days")]
    pub workload_min_consecutive_days: usize,
    /// Route timing pattern: average arrival delay must exceed this.
    #[serde(default = "default_route_delay_minutes")]
    pub route_delay_minutes: i64,
    /// Route timing pattern: number of delayed trips must exceed this.
    #[serde(default = "default_route_min_delayed_trips")]
    pub route_min_delayed_trips: usize,
    /// History window for metrics, patterns and the historical factor.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            tight_connection_minutes: default_tight_connection_minutes(),
            fatigue_max_daily_minutes: default_fatigue_max_daily_minutes(),
            historical_conflict_threshold: default_historical_conflict_threshold(),
            workload_min_schedules: default_workload_min_schedules(),
            workload_min_consecutive_days: default_workload_min_consecutive_days(),
            route_delay_minutes: default_route_delay_minutes(),
            route_min_delayed_trips: default_route_min_delayed_trips(),
            lookback_days: default_lookback_days(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

fn default_tight_connection_minutes() -> i64 {
    60
}

fn default_fatigue_max_daily_minutes() -> i64 {
    540
}

fn default_historical_conflict_threshold() -> usize {
    2
}

fn default_workload_min_schedules() -> usize {
    8
}

fn default_workload_min_consecutive_days() -> usize {
    5
}

fn default_route_delay_minutes() -> i64 {
    15
}

fn default_route_min_delayed_trips() -> usize {
    5
}

fn default_lookback_days() -> i64 {
    30
}

fn default_refresh_interval_secs() -> u64 {
    900
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierSettings {
    /// Per-session queue; events beyond it are dropped.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            session_queue_capacity: default_session_queue_capacity(),
        }
    }
}

fn default_session_queue_capacity() -> usize {
    64
}

impl DispatchConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Returns
    /// * `Err(RepositoryError::ConfigurationError)` if the file cannot be read,
    ///   parsed, or holds invalid values
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RepositoryError::configuration(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RepositoryError> {
        let config: DispatchConfig = toml::from_str(content).map_err(|e| {
            RepositoryError::configuration(format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location.
    ///
    /// Searches for `dispatch.toml` in:
    /// 1. Current directory
    /// 2. `backend/` directory
    /// 3. Parent directory
    pub fn from_default_location() -> Result<Self, RepositoryError> {
        match Self::default_path() {
            Some(path) => Self::from_file(path),
            None => Err(RepositoryError::configuration(
                "No dispatch.toml found in standard locations",
            )),
        }
    }

    /// Load from `DISPATCH_CONFIG` if set, else the default location, else
    /// fall back to built-in defaults.
    pub fn from_env() -> Result<Self, RepositoryError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) => Self::from_file(path),
            None => {
                log::debug!("No dispatch.toml found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    fn default_path() -> Option<PathBuf> {
        [
            PathBuf::from("dispatch.toml"),
            PathBuf::from("backend/dispatch.toml"),
            PathBuf::from("../dispatch.toml"),
        ]
        .into_iter()
        .find(|path| path.exists())
    }

    pub fn validate(&self) -> Result<(), RepositoryError> {
        if self.conflict.overlap_buffer_minutes < 0 {
            return Err(RepositoryError::configuration(
                "conflict.overlap_buffer_minutes must not be negative",
            ));
        }
        if self.resolution.reschedule_step_minutes <= 0 {
            return Err(RepositoryError::configuration(
                "resolution.reschedule_step_minutes must be positive",
            ));
        }
        if self.risk.tight_connection_minutes < 0
            || self.risk.fatigue_max_daily_minutes <= 0
            || self.risk.route_delay_minutes < 0
            || self.risk.lookback_days < 0
        {
            return Err(RepositoryError::configuration(
                "risk thresholds must not be negative",
            ));
        }
        if self.risk.refresh_interval_secs == 0 {
            return Err(RepositoryError::configuration(
                "risk.refresh_interval_secs must be positive",
            ));
        }
        if self.notifier.session_queue_capacity == 0 {
            return Err(RepositoryError::configuration(
                "notifier.session_queue_capacity must be positive",
            ));
        }
        Ok(())
    }

    pub fn overlap_buffer(&self) -> Duration {
        Duration::minutes(self.conflict.overlap_buffer_minutes)
    }

    pub fn reschedule_step(&self) -> Duration {
        Duration::minutes(self.resolution.reschedule_step_minutes)
    }

    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.risk.refresh_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DispatchConfig::from_toml_str("").unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.overlap_buffer(), Duration::minutes(30));
        assert_eq!(config.resolution.reschedule_max_steps, 3);
        assert_eq!(config.risk.workload_min_schedules, 8);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[conflict]
overlap_buffer_minutes = 15

[risk]
fatigue_max_daily_minutes = 480
"#;
        let config = DispatchConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.conflict.overlap_buffer_minutes, 15);
        assert_eq!(config.risk.fatigue_max_daily_minutes, 480);
        assert_eq!(config.risk.tight_connection_minutes, 60);
        assert_eq!(config.repository.repo_type, "local");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let toml = r#"
[resolution]
reschedule_step_minutes = 0
"#;
        assert!(DispatchConfig::from_toml_str(toml).is_err());

        let toml = r#"
[conflict]
overlap_buffer_minutes = -5
"#;
        assert!(DispatchConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[notifier]\nsession_queue_capacity = 8").unwrap();
        let config = DispatchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.notifier.session_queue_capacity, 8);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = DispatchConfig::from_file("/nonexistent/dispatch.toml").unwrap_err();
        assert!(matches!(err, RepositoryError::ConfigurationError { .. }));
    }
}
