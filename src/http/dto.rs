//! Data Transfer Objects for the HTTP API.
//!
//! Requests and list-view summaries. Full domain objects (events, maps,
//! plans, exports) already derive Serialize and go over the wire as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::api::{FeatureCollection, PlanExport, PlanSummary};
use crate::api::{DateObs, FieldId, Filter};
use crate::models::{Event, Field, HealpixMap, Plan, PlanArgs, PlanStatus, Telescope};
use crate::services::job_tracker::{JobStatus, LogEntry};
use crate::services::{MapAcquisition, PlanRequest};

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status of the service
    pub status: String,
    /// Version of the API
    pub version: String,
    /// Storage backend status
    pub database: String,
}

/// Response for endpoints that start a background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    /// Job ID for tracking the async processing
    pub job_id: String,
    /// Message about the operation
    pub message: String,
}

impl JobResponse {
    pub fn accepted(job_id: String) -> Self {
        let message = format!("Processing started. Track progress at /v1/jobs/{job_id}/logs");
        Self { job_id, message }
    }
}

/// Job status response for async processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub logs: Vec<LogEntry>,
    /// Result if completed
    pub result: Option<serde_json::Value>,
}

/// Event list response.
#[derive(Debug, Clone, Serialize)]
pub struct EventListResponse {
    pub events: Vec<Event>,
    pub total: usize,
}

/// Acquire a probability map for an event: either download a
/// multiresolution map document or synthesize one from an error cone
/// (`error` is the 1-sigma radius in degrees).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AcquireLocalizationRequest {
    Fetch { url: String },
    Cone { ra: f64, dec: f64, error: f64 },
}

impl AcquireLocalizationRequest {
    pub fn into_strategy(self) -> MapAcquisition {
        match self {
            AcquireLocalizationRequest::Fetch { url } => MapAcquisition::Fetch { url },
            AcquireLocalizationRequest::Cone { ra, dec, error } => {
                MapAcquisition::Cone { ra, dec, error }
            }
        }
    }
}

/// Localization list entry; the tile arrays only travel on the single-map
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizationInfoDto {
    pub localization_name: String,
    pub dateobs: DateObs,
    pub tiles: usize,
    pub has_distance: bool,
    pub has_contour: bool,
}

impl From<&HealpixMap> for LocalizationInfoDto {
    fn from(map: &HealpixMap) -> Self {
        Self {
            localization_name: map.name.clone(),
            dateobs: map.dateobs,
            tiles: map.uniq.len(),
            has_distance: map.distmu.is_some(),
            has_contour: map.contour.is_some(),
        }
    }
}

/// Localization list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizationListResponse {
    pub localizations: Vec<LocalizationInfoDto>,
    pub total: usize,
}

/// Request body for generating a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratePlanRequest {
    pub telescope: String,
    /// Name of the stored probability map to tile.
    pub map_name: String,
    /// Defaults to the canonical name derived from the arguments.
    #[serde(default)]
    pub plan_name: Option<String>,
    /// Defaults to the telescope's configured arguments.
    #[serde(default)]
    pub args: Option<PlanArgs>,
    /// Defaults to the event time.
    #[serde(default)]
    pub validity_window_start: Option<DateTime<Utc>>,
    /// Defaults to one day past the window start.
    #[serde(default)]
    pub validity_window_end: Option<DateTime<Utc>>,
}

impl GeneratePlanRequest {
    pub fn into_request(self, dateobs: DateObs) -> PlanRequest {
        PlanRequest {
            dateobs,
            telescope: self.telescope,
            map_name: self.map_name,
            plan_name: self.plan_name,
            args: self.args,
            validity_window_start: self.validity_window_start,
            validity_window_end: self.validity_window_end,
        }
    }
}

/// Plan list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanInfoDto {
    pub telescope: String,
    pub plan_name: String,
    pub localization_name: String,
    pub status: PlanStatus,
    pub num_observations: usize,
    pub validity_window_start: DateTime<Utc>,
    pub validity_window_end: DateTime<Utc>,
}

impl From<&Plan> for PlanInfoDto {
    fn from(plan: &Plan) -> Self {
        Self {
            telescope: plan.telescope.clone(),
            plan_name: plan.plan_name.clone(),
            localization_name: plan.localization_name.clone(),
            status: plan.status,
            num_observations: plan.num_observations(),
            validity_window_start: plan.validity_window_start,
            validity_window_end: plan.validity_window_end,
        }
    }
}

/// Plan list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanListResponse {
    pub plans: Vec<PlanInfoDto>,
    pub total: usize,
}

/// Telescope list response.
#[derive(Debug, Clone, Serialize)]
pub struct TelescopeListResponse {
    pub telescopes: Vec<Telescope>,
    pub total: usize,
}

/// Field list entry: the footprint ring without the pixel arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfoDto {
    pub field_id: FieldId,
    pub ra: qtty::Degrees,
    pub dec: qtty::Degrees,
    pub contour: Vec<[f64; 2]>,
    pub reference_filters: Vec<Filter>,
    pub reference_filter_mags: Vec<f64>,
}

impl From<&Field> for FieldInfoDto {
    fn from(field: &Field) -> Self {
        Self {
            field_id: field.field_id,
            ra: field.ra,
            dec: field.dec,
            contour: field.contour.clone(),
            reference_filters: field.reference_filters.clone(),
            reference_filter_mags: field.reference_filter_mags.clone(),
        }
    }
}

/// Field list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldListResponse {
    pub telescope: String,
    pub fields: Vec<FieldInfoDto>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_request_distinguishes_url_and_cone() {
        let fetch: AcquireLocalizationRequest = serde_json::from_str(
            r#"{"url": "https://gracedb.ligo.org/bayestar.fits.gz"}"#,
        )
        .unwrap();
        assert!(matches!(
            fetch.into_strategy(),
            MapAcquisition::Fetch { url } if url.ends_with("bayestar.fits.gz")
        ));

        let cone: AcquireLocalizationRequest =
            serde_json::from_str(r#"{"ra": 30.0, "dec": 10.0, "error": 2.5}"#).unwrap();
        assert!(matches!(
            cone.into_strategy(),
            MapAcquisition::Cone { ra, dec, error }
                if ra == 30.0 && dec == 10.0 && error == 2.5
        ));
    }

    #[test]
    fn generate_plan_request_defaults_optional_fields() {
        let request: GeneratePlanRequest = serde_json::from_str(
            r#"{"telescope": "ZTF", "map_name": "bayestar.fits.gz"}"#,
        )
        .unwrap();
        let dateobs: DateObs = "2019-04-25T08:18:05".parse().unwrap();
        let plan_request = request.into_request(dateobs);
        assert_eq!(plan_request.telescope, "ZTF");
        assert!(plan_request.plan_name.is_none());
        assert!(plan_request.args.is_none());
        assert!(plan_request.validity_window_start.is_none());
    }
}
