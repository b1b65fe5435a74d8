//! Repository trait definitions for the dispatch store.
//!
//! The store is split into focused traits so that the detector, planner
//! and executor can be exercised against an in-memory fake:
//!
//! - [`error`]: Error types for repository operations
//! - [`calendar`]: Schedule records, windowed queries, atomic batches
//! - [`directory`]: Driver and route reference data
//! - [`audit`]: Conflict and resolution audit trail
//!
//! # Convenience Trait Bound
//!
//! For services that need every capability, use [`FullRepository`]:
//!
//! ```ignore
//! async fn my_service(repo: &dyn FullRepository) -> RepositoryResult<()> {
//!     let drivers = repo.list_drivers().await?;
//!     let schedules = repo.list_schedules(&ScheduleFilter::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod calendar;
pub mod directory;
pub mod error;

pub use audit::AuditRepository;
pub use calendar::{BatchOutcome, CalendarBatch, CalendarRepository};
pub use directory::FleetDirectory;
pub use error::{ErrorContext, RepositoryError, RepositoryResult};

/// Composite trait bound for a complete repository implementation.
pub trait FullRepository: CalendarRepository + FleetDirectory + AuditRepository {}

// Blanket implementation: any type implementing all three traits is a FullRepository
impl<T> FullRepository for T where T: CalendarRepository + FleetDirectory + AuditRepository {}
