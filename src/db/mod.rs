//! Storage module for pipeline data.
//!
//! This module provides abstractions for storage operations via the
//! Repository pattern, allowing different backends to be swapped easily.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  HTTP Layer (http/) and Pipeline Services (services/)   │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Repository Traits (repository.rs) - Abstract Interface │
//! │  EventRepository / LocalizationRepository /             │
//! │  FieldRepository / PlanRepository                       │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//!     ┌───────────────▼──────────────────────────────┐
//!     │             Local Repository                  │
//!     │               (in-memory)                     │
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! Services receive the repository by reference (`&R` where
//! `R: FullRepository`, or an `Arc<dyn FullRepository>` in shared state);
//! there is no process-global instance.

#[cfg(not(feature = "local-repo"))]
compile_error!("Enable at least one repository backend feature.");

pub mod error;
#[cfg(feature = "local-repo")]
pub mod local;
pub mod repository;

pub use error::{ErrorContext, RepositoryError, RepositoryResult};
#[cfg(feature = "local-repo")]
pub use local::LocalRepository;
pub use repository::{
    EventRepository, FieldRepository, FullRepository, LocalizationRepository, PlanRepository,
};
