//! Repository factory for dependency injection.
//!
//! This module creates repository instances based on runtime configuration.

use std::str::FromStr;
use std::sync::Arc;

use super::repositories::LocalRepository;
use super::repository::{FullRepository, RepositoryError, RepositoryResult};
use crate::config::DispatchConfig;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryType {
    /// In-memory store
    Local,
}

impl FromStr for RepositoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            _ => Err(format!("Unknown repository type: {}", s)),
        }
    }
}

impl RepositoryType {
    /// Reads `REPOSITORY_TYPE`; defaults to `Local` when unset or unknown.
    pub fn from_env() -> Self {
        std::env::var("REPOSITORY_TYPE")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(Self::Local)
    }
}

pub struct RepositoryFactory;

impl RepositoryFactory {
    pub fn create(repo_type: RepositoryType) -> RepositoryResult<Arc<dyn FullRepository>> {
        match repo_type {
            RepositoryType::Local => Ok(Self::create_local()),
        }
    }

    pub fn create_local() -> Arc<dyn FullRepository> {
        Arc::new(LocalRepository::new())
    }

    /// Create the repository named by `repository.type` in the config.
    pub fn from_config(config: &DispatchConfig) -> RepositoryResult<Arc<dyn FullRepository>> {
        let repo_type = config.repository.repo_type.parse().map_err(|e: String| {
            RepositoryError::configuration(format!("Invalid repository type: {}", e))
        })?;
        Self::create(repo_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repository_type() {
        assert_eq!("local".parse::<RepositoryType>().unwrap(), RepositoryType::Local);
        assert_eq!("MEMORY".parse::<RepositoryType>().unwrap(), RepositoryType::Local);
        assert!("postgres".parse::<RepositoryType>().is_err());
    }

    #[test]
    fn test_from_config_rejects_unknown_type() {
        let mut config = DispatchConfig::default();
        config.repository.repo_type = "mongo".to_string();
        let err = RepositoryFactory::from_config(&config).err().unwrap();
        assert!(matches!(err, RepositoryError::ConfigurationError { .. }));
    }
}
