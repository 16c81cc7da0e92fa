//! In-memory local repository implementation.
//!
//! This module provides a local implementation of all repository traits
//! suitable for unit testing and single-node deployments. All data is stored
//! in memory using HashMap structures, providing fast, deterministic and
//! isolated execution.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::api::{DateObs, FeatureCollection, FieldId};
use crate::db::error::{ErrorContext, RepositoryError, RepositoryResult};
use crate::db::repository::{
    EventRepository, FieldRepository, LocalizationRepository, PlanRepository,
};
use crate::models::{Event, Field, GcnNotice, HealpixMap, Plan, PlanStatus, PlannedObservation};

/// In-memory local repository.
///
/// Cloning is cheap and clones share the same underlying store, so a single
/// repository can be handed to the HTTP state and to background tasks.
///
/// # Example
/// ```ignore
/// let repo = LocalRepository::new();
/// let event = repo.upsert_event(dateobs).await?;
/// ```
#[derive(Clone)]
pub struct LocalRepository {
    data: Arc<RwLock<LocalData>>,
}

struct LocalData {
    events: HashMap<DateObs, Event>,
    /// Maps per event, in insertion order; names are unique within an event.
    localizations: HashMap<DateObs, Vec<HealpixMap>>,
    fields: HashMap<(String, i64), Field>,
    plans: HashMap<(DateObs, String, String), Plan>,

    // Connection health
    is_healthy: bool,
}

impl Default for LocalData {
    fn default() -> Self {
        Self {
            events: HashMap::new(),
            localizations: HashMap::new(),
            fields: HashMap::new(),
            plans: HashMap::new(),
            is_healthy: true,
        }
    }
}

impl LocalRepository {
    /// Create a new empty local repository.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(LocalData::default())),
        }
    }

    /// Set the health status for testing connection failures.
    pub fn set_healthy(&self, healthy: bool) {
        let mut data = self.data.write().unwrap();
        data.is_healthy = healthy;
    }

    /// Number of events stored.
    pub fn event_count(&self) -> usize {
        self.data.read().unwrap().events.len()
    }

    /// Helper to check health and return error if unhealthy.
    fn check_health(&self) -> RepositoryResult<()> {
        let data = self.data.read().unwrap();
        if !data.is_healthy {
            return Err(RepositoryError::connection("Repository is not healthy"));
        }
        Ok(())
    }

    fn event_not_found(dateobs: DateObs, operation: &str) -> RepositoryError {
        RepositoryError::not_found_with_context(
            format!("No event for {dateobs}"),
            ErrorContext::new(operation)
                .with_entity("event")
                .with_entity_id(dateobs),
        )
    }

    fn plan_not_found(
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
        operation: &str,
    ) -> RepositoryError {
        RepositoryError::not_found_with_context(
            format!("No plan '{plan_name}' for {telescope} at {dateobs}"),
            ErrorContext::new(operation)
                .with_entity("plan")
                .with_entity_id(format!("{dateobs}/{telescope}/{plan_name}")),
        )
    }
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        let data = self.data.read().unwrap();
        Ok(data.is_healthy)
    }

    async fn upsert_event(&self, dateobs: DateObs) -> RepositoryResult<Event> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        let event = data
            .events
            .entry(dateobs)
            .or_insert_with(|| Event::new(dateobs));
        Ok(event.clone())
    }

    async fn get_event(&self, dateobs: DateObs) -> RepositoryResult<Event> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        data.events
            .get(&dateobs)
            .cloned()
            .ok_or_else(|| Self::event_not_found(dateobs, "get_event"))
    }

    async fn list_events(&self) -> RepositoryResult<Vec<Event>> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        let mut events: Vec<Event> = data.events.values().cloned().collect();
        events.sort_by(|a, b| b.dateobs.cmp(&a.dateobs));
        Ok(events)
    }

    async fn record_notice(&self, notice: &GcnNotice) -> RepositoryResult<bool> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        let event = data
            .events
            .get_mut(&notice.dateobs)
            .ok_or_else(|| Self::event_not_found(notice.dateobs, "record_notice"))?;
        Ok(event.add_notice(notice.clone()))
    }

    async fn merge_tags(&self, dateobs: DateObs, tags: &[String]) -> RepositoryResult<Event> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        let event = data
            .events
            .get_mut(&dateobs)
            .ok_or_else(|| Self::event_not_found(dateobs, "merge_tags"))?;
        event.merge_tags(tags.iter().cloned());
        Ok(event.clone())
    }

    async fn delete_event(&self, dateobs: DateObs) -> RepositoryResult<()> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        if data.events.remove(&dateobs).is_none() {
            return Err(Self::event_not_found(dateobs, "delete_event"));
        }
        data.localizations.remove(&dateobs);
        data.plans.retain(|(d, _, _), _| *d != dateobs);
        Ok(())
    }
}

#[async_trait]
impl LocalizationRepository for LocalRepository {
    async fn insert_localization(&self, map: HealpixMap) -> RepositoryResult<HealpixMap> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        if !data.events.contains_key(&map.dateobs) {
            return Err(Self::event_not_found(map.dateobs, "insert_localization"));
        }
        let maps = data.localizations.entry(map.dateobs).or_default();
        if let Some(existing) = maps.iter().find(|m| m.name == map.name) {
            return Ok(existing.clone());
        }
        maps.push(map.clone());
        Ok(map)
    }

    async fn get_localization(
        &self,
        dateobs: DateObs,
        name: &str,
    ) -> RepositoryResult<HealpixMap> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        data.localizations
            .get(&dateobs)
            .and_then(|maps| maps.iter().find(|m| m.name == name))
            .cloned()
            .ok_or_else(|| {
                RepositoryError::not_found_with_context(
                    format!("No localization '{name}' for {dateobs}"),
                    ErrorContext::new("get_localization")
                        .with_entity("localization")
                        .with_entity_id(format!("{dateobs}/{name}")),
                )
            })
    }

    async fn list_localizations(&self, dateobs: DateObs) -> RepositoryResult<Vec<HealpixMap>> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        Ok(data.localizations.get(&dateobs).cloned().unwrap_or_default())
    }

    async fn attach_contour(
        &self,
        dateobs: DateObs,
        name: &str,
        contour: FeatureCollection,
    ) -> RepositoryResult<()> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        let map = data
            .localizations
            .get_mut(&dateobs)
            .and_then(|maps| maps.iter_mut().find(|m| m.name == name))
            .ok_or_else(|| {
                RepositoryError::not_found_with_context(
                    format!("No localization '{name}' for {dateobs}"),
                    ErrorContext::new("attach_contour")
                        .with_entity("localization")
                        .with_entity_id(format!("{dateobs}/{name}")),
                )
            })?;
        map.contour = Some(contour);
        Ok(())
    }
}

#[async_trait]
impl FieldRepository for LocalRepository {
    async fn merge_fields(&self, fields: &[Field]) -> RepositoryResult<usize> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        for field in fields {
            data.fields.insert(
                (field.telescope.clone(), field.field_id.value()),
                field.clone(),
            );
        }
        Ok(fields.len())
    }

    async fn fields_for(&self, telescope: &str) -> RepositoryResult<Vec<Field>> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        let mut fields: Vec<Field> = data
            .fields
            .values()
            .filter(|f| f.telescope == telescope)
            .cloned()
            .collect();
        fields.sort_by_key(|f| f.field_id);
        Ok(fields)
    }

    async fn get_field(&self, telescope: &str, field_id: FieldId) -> RepositoryResult<Field> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        data.fields
            .get(&(telescope.to_string(), field_id.value()))
            .cloned()
            .ok_or_else(|| {
                RepositoryError::not_found_with_context(
                    format!("No field {field_id} for telescope {telescope}"),
                    ErrorContext::new("get_field")
                        .with_entity("field")
                        .with_entity_id(format!("{telescope}/{field_id}")),
                )
            })
    }
}

#[async_trait]
impl PlanRepository for LocalRepository {
    async fn create_plan(&self, plan: &Plan) -> RepositoryResult<Plan> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        let key = (
            plan.dateobs,
            plan.telescope.clone(),
            plan.plan_name.clone(),
        );
        if data.plans.contains_key(&key) {
            return Err(RepositoryError::validation_with_context(
                format!(
                    "Plan '{}' already exists for {} at {}",
                    plan.plan_name, plan.telescope, plan.dateobs
                ),
                ErrorContext::new("create_plan")
                    .with_entity("plan")
                    .with_entity_id(format!(
                        "{}/{}/{}",
                        plan.dateobs, plan.telescope, plan.plan_name
                    )),
            ));
        }
        data.plans.insert(key, plan.clone());
        Ok(plan.clone())
    }

    async fn get_plan(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
    ) -> RepositoryResult<Plan> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        data.plans
            .get(&(dateobs, telescope.to_string(), plan_name.to_string()))
            .cloned()
            .ok_or_else(|| Self::plan_not_found(dateobs, telescope, plan_name, "get_plan"))
    }

    async fn list_plans(&self, dateobs: DateObs) -> RepositoryResult<Vec<Plan>> {
        self.check_health()?;
        let data = self.data.read().unwrap();
        let mut plans: Vec<Plan> = data
            .plans
            .values()
            .filter(|p| p.dateobs == dateobs)
            .cloned()
            .collect();
        plans.sort_by(|a, b| {
            (&a.telescope, &a.plan_name).cmp(&(&b.telescope, &b.plan_name))
        });
        Ok(plans)
    }

    async fn complete_plan(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
        observations: Vec<PlannedObservation>,
    ) -> RepositoryResult<Plan> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        let plan = data
            .plans
            .get_mut(&(dateobs, telescope.to_string(), plan_name.to_string()))
            .ok_or_else(|| {
                Self::plan_not_found(dateobs, telescope, plan_name, "complete_plan")
            })?;
        plan.planned_observations = observations;
        if plan.status < PlanStatus::Ready {
            plan.status = PlanStatus::Ready;
        }
        Ok(plan.clone())
    }

    async fn mark_submitted(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
    ) -> RepositoryResult<Plan> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        let plan = data
            .plans
            .get_mut(&(dateobs, telescope.to_string(), plan_name.to_string()))
            .ok_or_else(|| {
                Self::plan_not_found(dateobs, telescope, plan_name, "mark_submitted")
            })?;
        if plan.status < PlanStatus::Ready {
            return Err(RepositoryError::validation_with_context(
                format!("Plan '{plan_name}' has not finished generating"),
                ErrorContext::new("mark_submitted")
                    .with_entity("plan")
                    .with_entity_id(format!("{dateobs}/{telescope}/{plan_name}")),
            ));
        }
        plan.status = PlanStatus::Submitted;
        Ok(plan.clone())
    }

    async fn delete_plan(
        &self,
        dateobs: DateObs,
        telescope: &str,
        plan_name: &str,
    ) -> RepositoryResult<()> {
        self.check_health()?;
        let mut data = self.data.write().unwrap();
        data.plans
            .remove(&(dateobs, telescope.to_string(), plan_name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::plan_not_found(dateobs, telescope, plan_name, "delete_plan"))
    }
}
