//! HTTP handlers for the REST API.
//!
//! Each handler corresponds to an API endpoint and delegates to the
//! service layer. Ingestion, map acquisition and plan generation return
//! `202 Accepted` with a job ID; everything else answers synchronously.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    Json,
};
use futures::stream::Stream;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;

use super::dto::{
    AcquireLocalizationRequest, EventListResponse, FeatureCollection, FieldInfoDto,
    FieldListResponse, GeneratePlanRequest, HealthResponse, JobResponse, JobStatusResponse,
    LocalizationInfoDto, LocalizationListResponse, PlanExport, PlanInfoDto, PlanListResponse,
    PlanSummary, TelescopeListResponse,
};
use super::error::AppError;
use super::state::AppState;
use crate::api::{DateObs, FieldId};
use crate::models::{Field, HealpixMap, Plan, WORKING_ORDER};
use crate::services::job_tracker::JobSubscription;
use crate::services::{compute_contour, pipeline, submission};

/// Result type for handlers.
pub type HandlerResult<T> = Result<Json<T>, AppError>;

fn parse_dateobs(raw: &str) -> Result<DateObs, AppError> {
    raw.parse().map_err(|_| {
        AppError::BadRequest(format!(
            "Invalid dateobs '{raw}': expected YYYY-MM-DDTHH:MM:SS"
        ))
    })
}

// =============================================================================
// Health Check
// =============================================================================

/// GET /health
///
/// Health check endpoint to verify the service is running and storage is accessible.
pub async fn health_check(State(state): State<AppState>) -> HandlerResult<HealthResponse> {
    let db_status = match state.repository.health_check().await {
        Ok(true) => "connected".to_string(),
        Ok(false) => "disconnected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: "v1".to_string(),
        database: db_status,
    }))
}

// =============================================================================
// Notice Ingestion
// =============================================================================

/// POST /v1/gcn
///
/// Ingest a VOEvent notice and run the follow-up pipeline asynchronously.
/// Returns a job ID for tracking progress.
pub async fn ingest_notice(
    State(state): State<AppState>,
    payload: String,
) -> Result<(StatusCode, Json<JobResponse>), AppError> {
    if payload.trim().is_empty() {
        return Err(AppError::BadRequest("Empty notice payload".to_string()));
    }

    let job_id = state.job_tracker.create_job();
    let response = JobResponse::accepted(job_id.clone());

    let tracker = state.job_tracker.clone();
    let repo = state.repository.clone();
    let allocator = state.allocator.clone();
    let notifier = state.notifier.clone();
    let client = state.client.clone();
    let config = state.config.clone();
    tokio::spawn(async move {
        let _ = pipeline::process_notice_async(
            job_id, tracker, repo, allocator, notifier, client, config, payload,
        )
        .await;
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

// =============================================================================
// Events
// =============================================================================

/// GET /v1/events
///
/// List all events, most recent first.
pub async fn list_events(State(state): State<AppState>) -> HandlerResult<EventListResponse> {
    let events = state.repository.list_events().await?;
    let total = events.len();

    Ok(Json(EventListResponse { events, total }))
}

/// GET /v1/events/{dateobs}
///
/// Get one event with its notice history and tags.
pub async fn get_event(
    State(state): State<AppState>,
    Path(dateobs): Path<String>,
) -> HandlerResult<crate::models::Event> {
    let dateobs = parse_dateobs(&dateobs)?;
    let event = state.repository.get_event(dateobs).await?;

    Ok(Json(event))
}

// =============================================================================
// Localizations
// =============================================================================

/// GET /v1/events/{dateobs}/localizations
///
/// List the probability maps stored for an event, without the tile arrays.
pub async fn list_localizations(
    State(state): State<AppState>,
    Path(dateobs): Path<String>,
) -> HandlerResult<LocalizationListResponse> {
    let dateobs = parse_dateobs(&dateobs)?;
    let maps = state.repository.list_localizations(dateobs).await?;

    let localizations: Vec<LocalizationInfoDto> = maps.iter().map(Into::into).collect();
    let total = localizations.len();

    Ok(Json(LocalizationListResponse {
        localizations,
        total,
    }))
}

/// POST /v1/events/{dateobs}/localizations
///
/// Acquire a probability map for an existing event asynchronously, either
/// by URL fetch or cone synthesis. Returns a job ID for tracking progress.
pub async fn acquire_localization(
    State(state): State<AppState>,
    Path(dateobs): Path<String>,
    Json(request): Json<AcquireLocalizationRequest>,
) -> Result<(StatusCode, Json<JobResponse>), AppError> {
    let dateobs = parse_dateobs(&dateobs)?;
    // Fail with 404 now rather than with a failed job later.
    state.repository.get_event(dateobs).await?;

    let job_id = state.job_tracker.create_job();
    let response = JobResponse::accepted(job_id.clone());

    let tracker = state.job_tracker.clone();
    let repo = state.repository.clone();
    let client = state.client.clone();
    let config = state.config.clone();
    let strategy = request.into_strategy();
    tokio::spawn(async move {
        let _ = pipeline::acquire_map_async(
            job_id, tracker, repo, client, config, dateobs, strategy,
        )
        .await;
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /v1/events/{dateobs}/localizations/{name}
///
/// Get one stored probability map including its tile arrays.
pub async fn get_localization(
    State(state): State<AppState>,
    Path((dateobs, name)): Path<(String, String)>,
) -> HandlerResult<HealpixMap> {
    let dateobs = parse_dateobs(&dateobs)?;
    let map = state.repository.get_localization(dateobs, &name).await?;

    Ok(Json(map))
}

/// GET /v1/events/{dateobs}/localizations/{name}/contour
///
/// Get the credible-region contour for a map, computing and caching it on
/// first request.
pub async fn get_contour(
    State(state): State<AppState>,
    Path((dateobs, name)): Path<(String, String)>,
) -> HandlerResult<FeatureCollection> {
    let dateobs = parse_dateobs(&dateobs)?;
    let contour = compute_contour(state.repository.as_ref(), dateobs, &name).await?;

    Ok(Json(contour))
}

// =============================================================================
// Plans
// =============================================================================

/// GET /v1/events/{dateobs}/plans
///
/// List the plans generated for an event across all telescopes.
pub async fn list_plans(
    State(state): State<AppState>,
    Path(dateobs): Path<String>,
) -> HandlerResult<PlanListResponse> {
    let dateobs = parse_dateobs(&dateobs)?;
    let plans = state.repository.list_plans(dateobs).await?;

    let plans: Vec<PlanInfoDto> = plans.iter().map(Into::into).collect();
    let total = plans.len();

    Ok(Json(PlanListResponse { plans, total }))
}

/// POST /v1/events/{dateobs}/plans
///
/// Generate an observing plan asynchronously. Returns a job ID for
/// tracking progress.
pub async fn generate_plan(
    State(state): State<AppState>,
    Path(dateobs): Path<String>,
    Json(request): Json<GeneratePlanRequest>,
) -> Result<(StatusCode, Json<JobResponse>), AppError> {
    let dateobs = parse_dateobs(&dateobs)?;
    if state.config.telescope(&request.telescope).is_none() {
        return Err(AppError::NotFound(format!(
            "Telescope {} not found",
            request.telescope
        )));
    }
    state.repository.get_event(dateobs).await?;

    let job_id = state.job_tracker.create_job();
    let response = JobResponse::accepted(job_id.clone());

    let tracker = state.job_tracker.clone();
    let repo = state.repository.clone();
    let allocator = state.allocator.clone();
    let config = state.config.clone();
    let plan_request = request.into_request(dateobs);
    tokio::spawn(async move {
        let _ = pipeline::generate_plan_async(
            job_id, tracker, repo, allocator, config, plan_request,
        )
        .await;
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /v1/events/{dateobs}/plans/{telescope}/{plan}
///
/// Get one plan including its scheduled observations.
pub async fn get_plan(
    State(state): State<AppState>,
    Path((dateobs, telescope, plan_name)): Path<(String, String, String)>,
) -> HandlerResult<Plan> {
    let dateobs = parse_dateobs(&dateobs)?;
    let plan = state
        .repository
        .get_plan(dateobs, &telescope, &plan_name)
        .await?;

    Ok(Json(plan))
}

/// DELETE /v1/events/{dateobs}/plans/{telescope}/{plan}
///
/// Delete a stored plan. Never contacts the scheduler backend: an
/// already-submitted queue entry stays until superseded.
pub async fn delete_plan(
    State(state): State<AppState>,
    Path((dateobs, telescope, plan_name)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    let dateobs = parse_dateobs(&dateobs)?;
    state
        .repository
        .delete_plan(dateobs, &telescope, &plan_name)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/events/{dateobs}/plans/{telescope}/{plan}/export
///
/// Render a READY plan in the queue wire format. A WORKING plan answers
/// `409 Conflict`.
pub async fn export_plan(
    State(state): State<AppState>,
    Path((dateobs, telescope, plan_name)): Path<(String, String, String)>,
) -> HandlerResult<PlanExport> {
    let dateobs = parse_dateobs(&dateobs)?;
    let export = submission::export_plan(
        state.repository.as_ref(),
        &state.config,
        dateobs,
        &telescope,
        &plan_name,
    )
    .await?;

    Ok(Json(export))
}

/// GET /v1/events/{dateobs}/plans/{telescope}/{plan}/summary
///
/// Coverage statistics for a READY plan. A WORKING plan answers
/// `409 Conflict`.
pub async fn get_plan_summary(
    State(state): State<AppState>,
    Path((dateobs, telescope, plan_name)): Path<(String, String, String)>,
) -> HandlerResult<PlanSummary> {
    let dateobs = parse_dateobs(&dateobs)?;
    let plan = state
        .repository
        .get_plan(dateobs, &telescope, &plan_name)
        .await?;
    let map = state
        .repository
        .get_localization(dateobs, &plan.localization_name)
        .await?;
    let fields: HashMap<FieldId, Field> = state
        .repository
        .fields_for(&telescope)
        .await?
        .into_iter()
        .map(|f| (f.field_id, f))
        .collect();

    // Rasterizing the map is CPU-intensive, keep it off the async runtime.
    let summary = tokio::task::spawn_blocking(move || {
        let flat = map.flatten(WORKING_ORDER);
        plan.summary(&fields, &flat)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))??;

    Ok(Json(summary))
}

/// POST /v1/events/{dateobs}/plans/{telescope}/{plan}/submit
///
/// Submit a READY plan to its telescope's scheduler backend and mark it
/// SUBMITTED.
pub async fn submit_plan(
    State(state): State<AppState>,
    Path((dateobs, telescope, plan_name)): Path<(String, String, String)>,
) -> HandlerResult<PlanInfoDto> {
    let dateobs = parse_dateobs(&dateobs)?;
    let plan = submission::submit_plan(
        state.repository.as_ref(),
        &state.client,
        &state.config,
        dateobs,
        &telescope,
        &plan_name,
    )
    .await?;

    Ok(Json(PlanInfoDto::from(&plan)))
}

// =============================================================================
// Telescopes
// =============================================================================

/// GET /v1/telescopes
///
/// List the configured telescope roster.
pub async fn list_telescopes(
    State(state): State<AppState>,
) -> HandlerResult<TelescopeListResponse> {
    let telescopes = state.config.telescopes.clone();
    let total = telescopes.len();

    Ok(Json(TelescopeListResponse { telescopes, total }))
}

/// GET /v1/telescopes/{name}/fields
///
/// List a telescope's field tessellation without the pixel arrays.
pub async fn get_telescope_fields(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> HandlerResult<FieldListResponse> {
    if state.config.telescope(&name).is_none() {
        return Err(AppError::NotFound(format!("Telescope {} not found", name)));
    }
    let fields = state.repository.fields_for(&name).await?;

    let fields: Vec<FieldInfoDto> = fields.iter().map(Into::into).collect();
    let total = fields.len();

    Ok(Json(FieldListResponse {
        telescope: name,
        fields,
        total,
    }))
}

// =============================================================================
// Async Job Management
// =============================================================================

/// GET /v1/jobs/{job_id}
///
/// Get the current status and logs of a background job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> HandlerResult<JobStatusResponse> {
    let job = state
        .job_tracker
        .get_job(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

    Ok(Json(JobStatusResponse {
        job_id: job.job_id,
        status: job.status,
        logs: job.logs,
        result: job.result,
    }))
}

/// GET /v1/jobs/{job_id}/logs
///
/// Stream job logs via Server-Sent Events (SSE): the backlog first, then
/// live entries until the job reaches a terminal state, then a final
/// `complete` event carrying the status and result.
pub async fn stream_job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let subscription = state
        .job_tracker
        .subscribe(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;

    let tracker = state.job_tracker.clone();
    let stream = async_stream::stream! {
        let JobSubscription { backlog, live } = subscription;
        for entry in backlog {
            let data = serde_json::to_string(&entry).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }

        if let Some(mut receiver) = live {
            loop {
                match receiver.recv().await {
                    Ok(entry) => {
                        let data = serde_json::to_string(&entry).unwrap_or_default();
                        yield Ok(Event::default().data(data));
                    }
                    // Overwritten entries are still in the stored log; the
                    // stream just picks up from where the buffer starts.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    // Sender dropped on the terminal transition.
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        if let Some(job) = tracker.get_job(&job_id) {
            let final_event = serde_json::json!({
                "status": job.status,
                "result": job.result,
            });
            yield Ok(Event::default()
                .event("complete")
                .data(serde_json::to_string(&final_event).unwrap_or_default()));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(1))
            .text("keep-alive"),
    ))
}
