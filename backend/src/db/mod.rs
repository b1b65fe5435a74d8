//! Storage layer for the dispatch core.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Service Layer (crate::services) - detection, planning, │
//! │  execution, risk analysis, notification                 │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Repository Traits (repository/) - Abstract Interface   │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//!     ┌───────────────▼──────────────────────────────┐
//!     │             Local Repository                  │
//!     │               (in-memory)                     │
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! - `repository`: Trait definitions (calendar, fleet directory, audit)
//! - `repositories::local`: In-memory implementation
//! - `factory`: Factory for creating repository instances

#[cfg(not(feature = "local-repo"))]
compile_error!("Enable at least one repository backend feature.");

pub mod factory;
pub mod repositories;
pub mod repository;

pub use factory::{RepositoryFactory, RepositoryType};
pub use repositories::LocalRepository;
pub use repository::{
    AuditRepository, BatchOutcome, CalendarBatch, CalendarRepository, ErrorContext,
    FleetDirectory, FullRepository, RepositoryError, RepositoryResult,
};
