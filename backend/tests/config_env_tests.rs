mod support;

use std::io::Write;

use fleet_dispatch::config::{DispatchConfig, CONFIG_PATH_ENV};
use fleet_dispatch::db::{CalendarRepository, RepositoryError, RepositoryFactory, RepositoryType};
use support::with_scoped_env;

#[test]
fn test_config_path_from_env_is_loaded() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[conflict]\noverlap_buffer_minutes = 15\n\n[risk]\nlookback_days = 7\n"
    )
    .unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let config = with_scoped_env(&[(CONFIG_PATH_ENV, Some(path.as_str()))], DispatchConfig::from_env).unwrap();
    assert_eq!(config.conflict.overlap_buffer_minutes, 15);
    assert_eq!(config.risk.lookback_days, 7);
    assert_eq!(config.resolution.reschedule_max_steps, 3);
}

#[test]
fn test_missing_config_file_is_an_error() {
    let result = with_scoped_env(
        &[(CONFIG_PATH_ENV, Some("/nonexistent/dispatch.toml"))],
        DispatchConfig::from_env,
    );
    assert!(matches!(result, Err(RepositoryError::ConfigurationError { .. })));
}

#[test]
fn test_invalid_thresholds_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[notifier]\nsession_queue_capacity = 0").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let result = with_scoped_env(&[(CONFIG_PATH_ENV, Some(path.as_str()))], DispatchConfig::from_env);
    assert!(result.is_err());
}

#[test]
fn test_repository_type_from_env() {
    let repo_type = with_scoped_env(&[("REPOSITORY_TYPE", Some("memory"))], RepositoryType::from_env);
    assert_eq!(repo_type, RepositoryType::Local);

    let fallback = with_scoped_env(&[("REPOSITORY_TYPE", Some("oracle"))], RepositoryType::from_env);
    assert_eq!(fallback, RepositoryType::Local);
}

#[tokio::test]
async fn test_factory_builds_configured_repository() {
    let repo = RepositoryFactory::from_config(&DispatchConfig::default()).unwrap();
    assert!(repo.health_check().await.unwrap());
}
