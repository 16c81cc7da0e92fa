//! Repository trait definitions for pipeline storage.
//!
//! This module provides a collection of focused repository traits that
//! abstract the event store. By splitting responsibilities across multiple
//! traits, implementations can be more focused and testable:
//!
//! - [`EventRepository`]: events and their GCN notices
//! - [`LocalizationRepository`]: probability maps and cached contours
//! - [`FieldRepository`]: telescope field tessellations
//! - [`PlanRepository`]: observing plans and their lifecycle
//!
//! # Trait Composition
//!
//! A complete repository implementation implements all four traits. For
//! functions that need the whole store, use the [`FullRepository`] bound:
//!
//! ```ignore
//! async fn my_service<R: FullRepository>(repo: &R) -> RepositoryResult<()> {
//!     let event = repo.upsert_event(dateobs).await?;
//!     repo.insert_localization(map).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;

use super::error::RepositoryResult;
use crate::api::{DateObs, FeatureCollection, FieldId};
use crate::models::{Event, Field, GcnNotice, HealpixMap, Plan, PlannedObservation};

/// Repository trait for events and their notices.
///
/// Events are keyed by their rounded UTC timestamp; the notice list under an
/// event is append-only and sorted by notice date.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Check if the storage backend is reachable and healthy.
    async fn health_check(&self) -> RepositoryResult<bool>;

    /// Fetch the event for `dateobs`, creating an empty one if absent.
    ///
    /// # Returns
    /// * `Ok(Event)` - The stored event after the upsert
    async fn upsert_event(&self, dateobs: DateObs) -> RepositoryResult<Event>;

    /// Retrieve an event by its timestamp key.
    ///
    /// # Returns
    /// * `Ok(Event)` - The event with all notices and tags
    /// * `Err(RepositoryError::NotFound)` - If no event exists for `dateobs`
    async fn get_event(&self, dateobs: DateObs) -> RepositoryResult<Event>;

    /// List all events, most recent first.
    async fn list_events(&self) -> RepositoryResult<Vec<Event>>;

    /// Append a notice to its event's notice list.
    ///
    /// Idempotent per IVORN: a notice whose IVORN is already recorded is
    /// skipped, whatever its payload.
    ///
    /// # Returns
    /// * `Ok(true)` - The notice was added
    /// * `Ok(false)` - A notice with this IVORN was already present
    /// * `Err(RepositoryError::NotFound)` - If the parent event is missing
    async fn record_notice(&self, notice: &GcnNotice) -> RepositoryResult<bool>;

    /// Union `tags` into the event's tag set.
    ///
    /// # Returns
    /// * `Ok(Event)` - The event after the merge
    async fn merge_tags(&self, dateobs: DateObs, tags: &[String]) -> RepositoryResult<Event>;

    /// Delete an event together with its localizations and plans.
    async fn delete_event(&self, dateobs: DateObs) -> RepositoryResult<()>;
}

/// Repository trait for probability maps.
///
/// Maps are immutable once stored, except for the cached contour slot.
#[async_trait]
pub trait LocalizationRepository: Send + Sync {
    /// Store a map under its (event, name) key.
    ///
    /// Create-once semantics: when a map with the same key already exists,
    /// the stored copy is returned unchanged and the argument is discarded,
    /// so concurrent acquisitions of the same map cannot fight.
    async fn insert_localization(&self, map: HealpixMap) -> RepositoryResult<HealpixMap>;

    /// Retrieve a map by its (event, name) key.
    ///
    /// # Returns
    /// * `Ok(HealpixMap)` - The map, including any cached contour
    /// * `Err(RepositoryError::NotFound)` - If the map doesn't exist
    async fn get_localization(
        &self,
        dateobs: DateObs,
        name: &str,
    ) -> RepositoryResult<HealpixMap>;

    /// List all maps recorded for an event, in insertion order.
    async fn list_localizations(&self, dateobs: DateObs) -> RepositoryResult<Vec<HealpixMap>>;

    /// Attach a computed credible-region contour to a stored map.
    ///
    /// # Returns
    /// * `Err(RepositoryError::NotFound)` - If the map doesn't exist
    async fn attach_contour(
        &self,
        dateobs: DateObs,
        name: &str,
        contour: FeatureCollection,
    ) -> RepositoryResult<()>;
}

/// Repository trait for telescope field tessellations.
#[async_trait]
pub trait FieldRepository: Send + Sync {
    /// Insert or replace fields, keyed by (telescope, field id).
    ///
    /// # Returns
    /// * `Ok(usize)` - Number of fields written
    async fn merge_fields(&self, fields: &[Field]) -> RepositoryResult<usize>;

    /// All fields of one telescope, ordered by field id.
    async fn fields_for(&self, telescope: &str) -> RepositoryResult<Vec<Field>>;

    /// Retrieve a single field.
    ///
    /// # Returns
    /// * `Err(RepositoryError::NotFound)` - If the field doesn't exist
    async fn get_field(&self, telescope: &str, field_id: FieldId) -> RepositoryResult<Field>;
}

/// Repository trait for observing plans.
///
/// Plans are keyed by (event, telescope, name). Status only moves forward:
/// `working` → `ready` → `submitted`.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Store a new plan.
    ///
    /// # Returns
    /// * `Ok(Plan)` - The stored plan
    /// * `Err(RepositoryError::ValidationError)` - If a plan with the same
    ///   (event, telescope, name) key already exists
    async fn create_plan(&self, plan: &Plan) -> RepositoryResult<Plan>;

    /// Retrieve a plan by its full key.
    ///
    /// # Returns
    /// * `Err(RepositoryError::NotFound)` - If the plan doesn't exist
    async fn get_plan(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
    ) -> RepositoryResult<Plan>;

    /// All plans of one event, ordered by telescope then name.
    async fn list_plans(&self, dateobs: DateObs) -> RepositoryResult<Vec<Plan>>;

    /// Terminal update of plan generation: attach the observation list and
    /// advance status to `ready` in one step.
    ///
    /// # Returns
    /// * `Ok(Plan)` - The completed plan
    /// * `Err(RepositoryError::NotFound)` - If the plan was deleted while
    ///   generation was running; the caller must treat this as cancellation
    async fn complete_plan(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
        observations: Vec<PlannedObservation>,
    ) -> RepositoryResult<Plan>;

    /// Advance a plan to `submitted` after successful dispatch.
    ///
    /// # Returns
    /// * `Err(RepositoryError::NotFound)` - If the plan doesn't exist
    async fn mark_submitted(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
    ) -> RepositoryResult<Plan>;

    /// Delete a plan. Deleting a `working` plan cancels its generation.
    async fn delete_plan(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
    ) -> RepositoryResult<()>;
}

/// Composite trait bound for a complete repository implementation.
///
/// Automatically implemented for any type that implements all four
/// repository traits.
pub trait FullRepository:
    EventRepository + LocalizationRepository + FieldRepository + PlanRepository
{
}

impl<T> FullRepository for T where
    T: EventRepository + LocalizationRepository + FieldRepository + PlanRepository
{
}
