//! Alert correlation.
//!
//! Every incoming notice funnels through [`ingest_notice`]: the event row
//! keyed by the rounded observation time is created or reused, the notice is
//! appended, classification tags are merged, and the map-acquisition
//! strategy for the downstream pipeline is selected. Outbound notification
//! fires exactly once whenever the merged tag set crosses the alert-worthy
//! boundary, in either direction.

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info};

use crate::api::DateObs;
use crate::db::{EventRepository, RepositoryError};
use crate::models::{Event, NoticeType};
use crate::services::acquisition::{one_sigma_radius, MapAcquisition};
use crate::voevent::{self, ParsedNotice, VoeventError};

/// Tags that make an event worth following up.
const DESIRABLE_TAGS: [&str; 3] = ["short", "GW", "AMON"];
/// Tags that veto follow-up regardless of what else is present.
const UNDESIRABLE_TAGS: [&str; 3] = ["transient", "MDC", "retracted"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unusable notice: {0}")]
    Parse(#[from] VoeventError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Receiver for alert-worthiness changes. The notification body and
/// transport live outside this crate; implementations only observe the
/// event.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, event: &Event);
}

/// Notifier that drops every notification.
pub struct NoopNotifier;

#[async_trait]
impl AlertNotifier for NoopNotifier {
    async fn notify(&self, _event: &Event) {}
}

/// What one ingested notice changed, and what to do next.
#[derive(Debug)]
pub struct IngestOutcome {
    pub dateobs: DateObs,
    pub notice_added: bool,
    pub tags_changed: bool,
    /// The alert-worthy predicate flipped (the notifier has already run).
    pub alertable_edge: bool,
    /// Map acquisition to execute, when the notice localizes the event.
    pub acquisition: Option<MapAcquisition>,
}

/// Classification tags derived from one notice. Each rule contributes zero
/// or more tags independently; the result is merged into the event's set,
/// so order and duplicates carry no meaning.
pub fn tags_for(parsed: &ParsedNotice) -> Vec<String> {
    let mut tags = Vec::new();

    if !parsed.stream.is_empty() {
        tags.push(parsed.stream.clone());
    }

    match parsed.why_concept.as_deref() {
        Some("process.variation.burst;em.gamma") => tags.push("GRB".to_string()),
        Some("process.variation.trans;em.gamma") => tags.push("transient".to_string()),
        _ => {}
    }

    if parsed.notice_type.is_lvc() {
        tags.push("GW".to_string());
    }
    if parsed.notice_type == NoticeType::LvcRetraction {
        tags.push("retracted".to_string());
    }

    // Burst duration class, under either param convention. Missions report
    // "unknown" when undetermined; that is not a tag.
    for duration in [&parsed.long_short, &parsed.duration_class] {
        if let Some(value) = duration {
            let lower = value.to_lowercase();
            if lower != "unknown" {
                tags.push(lower);
            }
        }
    }

    if let Some((name, _)) = parsed
        .classification
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        tags.push(name.clone());
    }

    if let Some(search) = &parsed.search {
        tags.push(search.clone());
    }

    tags
}

/// Whether a tag set marks an event for outbound alerting: at least one
/// desirable tag and no undesirable one.
pub fn alert_worthy(tags: &BTreeSet<String>) -> bool {
    let has = |names: &[&str]| names.iter().any(|n| tags.contains(*n));
    has(&DESIRABLE_TAGS) && !has(&UNDESIRABLE_TAGS)
}

/// Pick the map-acquisition strategy for a notice, or `None` when the
/// notice carries no localization (retractions, bare timing notices).
///
/// Fermi final positions publish only a PNG sky plot; its URL converts to
/// the HEALPix FITS next to it. Subthreshold notices and the GW stream
/// carry direct map URLs. Anything else falls back to the error cone,
/// with the mission radius converted to 1-sigma.
pub fn select_strategy(parsed: &ParsedNotice) -> Option<MapAcquisition> {
    if parsed.notice_type == NoticeType::FermiGbmFinPos {
        if let Some(url) = &parsed.location_map_url {
            let url = url
                .replace("http://", "https://")
                .replace("_locplot_", "_healpix_")
                .replace(".png", ".fit");
            return Some(MapAcquisition::Fetch { url });
        }
    }
    if parsed.notice_type == NoticeType::FermiGbmSubthresh {
        if let Some(url) = &parsed.healpix_url {
            return Some(MapAcquisition::Fetch { url: url.clone() });
        }
    }
    if let Some(url) = &parsed.skymap_url {
        return Some(MapAcquisition::Fetch { url: url.clone() });
    }
    if parsed.retraction == Some(1) {
        return None;
    }
    let cone = parsed.position?;
    Some(MapAcquisition::Cone {
        ra: cone.ra,
        dec: cone.dec,
        error: one_sigma_radius(cone.error_radius, &parsed.stream),
    })
}

/// Ingest one raw notice payload.
///
/// Re-delivery of a byte-identical payload under a known ivorn is a no-op
/// (no tag merge, no fan-out). A changed payload under a known ivorn keeps
/// the stored notice but still re-derives tags and the acquisition
/// strategy.
pub async fn ingest_notice<R, N>(
    repo: &R,
    notifier: &N,
    payload: &str,
) -> Result<IngestOutcome, IngestError>
where
    R: EventRepository + ?Sized,
    N: AlertNotifier + ?Sized,
{
    let parsed = voevent::parse(payload)?;
    let notice = parsed.to_notice(payload);

    let event = repo.upsert_event(parsed.dateobs).await?;
    let old_tags = event.tags.clone();

    if event
        .gcn_notices
        .iter()
        .any(|n| n.ivorn == notice.ivorn && n.payload_digest() == notice.payload_digest())
    {
        debug!(ivorn = %notice.ivorn, "duplicate notice delivery ignored");
        return Ok(IngestOutcome {
            dateobs: parsed.dateobs,
            notice_added: false,
            tags_changed: false,
            alertable_edge: false,
            acquisition: None,
        });
    }

    let notice_added = repo.record_notice(&notice).await?;
    let updated = repo.merge_tags(parsed.dateobs, &tags_for(&parsed)).await?;
    let tags_changed = updated.tags != old_tags;

    let alertable_edge = alert_worthy(&old_tags) != alert_worthy(&updated.tags);
    if alertable_edge {
        info!(dateobs = %parsed.dateobs, tags = ?updated.display_tags(),
            "alert-worthiness changed, notifying");
        notifier.notify(&updated).await;
    }

    Ok(IngestOutcome {
        dateobs: parsed.dateobs,
        notice_added,
        tags_changed,
        alertable_edge,
        acquisition: select_strategy(&parsed),
    })
}
