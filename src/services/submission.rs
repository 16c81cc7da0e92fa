//! Plan submission to scheduler backends.
//!
//! A READY plan is exported and handed to its telescope's backend: queue
//! backends receive the export as a PUT to their queue resource, file-drop
//! backends get one file per plan named by queue name (overwritten on
//! resubmit). Successful dispatch advances the plan to SUBMITTED. Deleting
//! a plan never contacts the backend; an already-submitted queue entry is
//! superseded by the next submission under the same queue name.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::api::{DateObs, FieldId, FlatExposure, PlanExport, QueueTarget};
use crate::config::AppConfig;
use crate::db::{FullRepository, RepositoryError};
use crate::models::telescope::{FileFormat, SchedulerBackend};
use crate::models::{Field, Plan, PlanError, Telescope};

/// Stream label used when an event somehow has no notices on record.
const UNKNOWN_STREAM: &str = "GCN";

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("unknown telescope {0}")]
    UnknownTelescope(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("queue submission to {url} failed: {source}")]
    Queue {
        url: String,
        source: reqwest::Error,
    },
    #[error("queue submission to {url} returned HTTP {status}")]
    QueueStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("writing plan file {path:?}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encoding plan file: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Queue wire format: the plan export plus the queue discipline marker the
/// scheduler expects.
#[derive(Debug, Serialize)]
struct QueuePayload<'a> {
    targets: &'a [QueueTarget],
    queue_name: &'a str,
    validity_window_mjd: [f64; 2],
    queue_type: &'static str,
}

/// Everything needed to render a plan for its backend.
struct ExportContext<'a> {
    telescope: &'a Telescope,
    plan: Plan,
    stream: String,
    fields: HashMap<FieldId, Field>,
}

async fn load_context<'a, R>(
    repo: &R,
    config: &'a AppConfig,
    dateobs: DateObs,
    telescope_name: &str,
    plan_name: &str,
) -> Result<ExportContext<'a>, SubmissionError>
where
    R: FullRepository + ?Sized,
{
    let telescope = config
        .telescope(telescope_name)
        .ok_or_else(|| SubmissionError::UnknownTelescope(telescope_name.to_string()))?;
    let plan = repo.get_plan(dateobs, telescope_name, plan_name).await?;
    let event = repo.get_event(dateobs).await?;
    let stream = event
        .gcn_notices
        .last()
        .map(|n| n.stream.clone())
        .unwrap_or_else(|| UNKNOWN_STREAM.to_string());
    let fields: HashMap<FieldId, Field> = repo
        .fields_for(telescope_name)
        .await?
        .into_iter()
        .map(|f| (f.field_id, f))
        .collect();
    Ok(ExportContext {
        telescope,
        plan,
        stream,
        fields,
    })
}

/// Render a READY plan in the queue wire format without dispatching it.
///
/// A WORKING plan surfaces as [`PlanError::NotReady`].
pub async fn export_plan<R>(
    repo: &R,
    config: &AppConfig,
    dateobs: DateObs,
    telescope_name: &str,
    plan_name: &str,
) -> Result<PlanExport, SubmissionError>
where
    R: FullRepository + ?Sized,
{
    let ctx = load_context(repo, config, dateobs, telescope_name, plan_name).await?;
    Ok(ctx
        .plan
        .export(&ctx.stream, &ctx.telescope.program_pi, &ctx.fields)?)
}

/// Submit a plan to its telescope's scheduler backend and mark it
/// `submitted`.
///
/// The plan must be at least READY; a WORKING plan surfaces as
/// [`PlanError::NotReady`] and the stored status is left untouched.
/// Resubmission of a SUBMITTED plan re-dispatches and is otherwise a no-op.
pub async fn submit_plan<R>(
    repo: &R,
    client: &reqwest::Client,
    config: &AppConfig,
    dateobs: DateObs,
    telescope_name: &str,
    plan_name: &str,
) -> Result<Plan, SubmissionError>
where
    R: FullRepository + ?Sized,
{
    let ctx = load_context(repo, config, dateobs, telescope_name, plan_name).await?;

    match &ctx.telescope.backend {
        SchedulerBackend::HttpQueue { base_url } => {
            let export = ctx
                .plan
                .export(&ctx.stream, &ctx.telescope.program_pi, &ctx.fields)?;
            put_queue(client, base_url, &export).await?;
            info!(dateobs = %dateobs, telescope = telescope_name, plan = plan_name,
                targets = export.targets.len(), "plan submitted to queue");
        }
        SchedulerBackend::FileDrop { dir, format } => {
            let rows = ctx.plan.flat_exposures(
                &ctx.stream,
                &ctx.fields,
                ctx.telescope.expand_dithers,
            )?;
            let path = drop_path(config, dir, *format, &ctx.plan.queue_name());
            write_drop_file(&path, *format, &rows).await?;
            info!(dateobs = %dateobs, telescope = telescope_name, plan = plan_name,
                rows = rows.len(), path = %path.display(), "plan written for pickup");
        }
    }

    Ok(repo.mark_submitted(dateobs, telescope_name, plan_name).await?)
}

async fn put_queue(
    client: &reqwest::Client,
    base_url: &str,
    export: &PlanExport,
) -> Result<(), SubmissionError> {
    let url = format!("{}/queues", base_url.trim_end_matches('/'));
    let payload = QueuePayload {
        targets: &export.targets,
        queue_name: &export.queue_name,
        validity_window_mjd: export.validity_window_mjd,
        queue_type: "list",
    };
    let response = client
        .put(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|source| SubmissionError::Queue {
            url: url.clone(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(SubmissionError::QueueStatus { url, status });
    }
    Ok(())
}

/// Target path for a file-drop submission; relative backend directories
/// resolve under the configured data root.
fn drop_path(config: &AppConfig, dir: &Path, format: FileFormat, queue_name: &str) -> PathBuf {
    let dir = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        config.data_dir.join(dir)
    };
    let extension = match format {
        FileFormat::Json => "json",
        FileFormat::Csv => "csv",
    };
    dir.join(format!("{queue_name}.{extension}"))
}

async fn write_drop_file(
    path: &Path,
    format: FileFormat,
    rows: &[FlatExposure],
) -> Result<(), SubmissionError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| SubmissionError::File {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    let body = match format {
        FileFormat::Json => serde_json::to_string_pretty(rows)?,
        FileFormat::Csv => csv_body(rows),
    };
    tokio::fs::write(path, body)
        .await
        .map_err(|source| SubmissionError::File {
            path: path.to_path_buf(),
            source,
        })
}

fn csv_body(rows: &[FlatExposure]) -> String {
    let mut out = String::from(
        "queue_name,seqnum,seqtot,field_id,ra,dec,filter,exposure_time,subprogram_name\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            row.queue_name,
            row.seqnum,
            row.seqtot,
            row.field_id,
            row.ra.value(),
            row.dec.value(),
            row.filter,
            row.exposure_time,
            row.subprogram_name,
        ));
    }
    out
}
