//! Probability-map acquisition.
//!
//! Maps arrive one of two ways: downloaded from a mission-hosted URL, or
//! synthesized from an error cone when the notice only carries a position.
//! Both paths persist through [`LocalizationRepository::insert_localization`],
//! which is create-once, so re-running an acquisition for an already-stored
//! (event, name) pair returns the existing row untouched.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::DateObs;
use crate::config::AcquisitionSettings;
use crate::db::{LocalizationRepository, RepositoryError};
use crate::healpix;
use crate::models::{HealpixMap, MapError, MapPayload};

/// 95th percentile of a chi distribution with two degrees of freedom.
pub const CHI_2DOF_P95: f64 = 2.4477468306808161;

/// Convert a mission-reported error radius (degrees) to the 1-sigma radius
/// the Gaussian cone profile expects. AMON radii are taken as-is; every
/// other mission's radius is divided by the 95th-percentile chi quantile.
pub fn one_sigma_radius(error_radius: f64, mission: &str) -> f64 {
    if mission == "AMON" {
        error_radius
    } else {
        error_radius / CHI_2DOF_P95
    }
}

/// How to obtain a probability map for an event. Selected once per notice
/// by the correlator, executed by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum MapAcquisition {
    /// Download a multiresolution map document.
    Fetch { url: String },
    /// Synthesize a Gaussian map from a cone; `error` is the 1-sigma
    /// radius in degrees.
    Cone { ra: f64, dec: f64, error: f64 },
}

impl MapAcquisition {
    /// Name the stored map row will carry.
    pub fn map_name(&self) -> String {
        match self {
            MapAcquisition::Fetch { url } => fetch_map_name(url),
            MapAcquisition::Cone { ra, dec, error } => cone_map_name(*ra, *dec, *error),
        }
    }

    /// Run the acquisition and persist the result. Returns the stored row,
    /// which is the pre-existing one when the map was already acquired.
    pub async fn acquire<R>(
        &self,
        repo: &R,
        client: &reqwest::Client,
        policy: &FetchPolicy,
        dateobs: DateObs,
    ) -> Result<HealpixMap, AcquisitionError>
    where
        R: LocalizationRepository + ?Sized,
    {
        let map = match self {
            MapAcquisition::Fetch { url } => fetch_map(client, url, dateobs, policy).await?,
            MapAcquisition::Cone { ra, dec, error } => {
                synthesize_cone(*ra, *dec, *error, dateobs)?
            }
        };
        Ok(repo.insert_localization(map).await?)
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("requesting {url}: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },
    #[error("decoding map body from {url}: {source}")]
    Decode {
        url: String,
        source: reqwest::Error,
    },
    #[error("map fetch from {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<AcquisitionError>,
    },
    #[error(transparent)]
    InvalidMap(#[from] MapError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl AcquisitionError {
    /// Transient failures are worth retrying: connection and timeout
    /// errors, server-side 5xx, and 429 throttling. Everything else (other
    /// 4xx, undecodable bodies, invalid maps) is permanent.
    fn is_transient(&self) -> bool {
        match self {
            AcquisitionError::Request { source, .. } => {
                source.is_connect() || source.is_timeout()
            }
            AcquisitionError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Retry schedule for map downloads: exponential backoff from `base_delay`,
/// doubling per attempt, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl From<&AcquisitionSettings> for FetchPolicy {
    fn from(settings: &AcquisitionSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
        }
    }
}

impl FetchPolicy {
    /// Delay before the retry following 0-based `attempt`.
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(31))
            .min(self.max_delay)
    }
}

/// Download and validate a map. Transient failures retry per `policy`;
/// permanent ones surface immediately.
pub async fn fetch_map(
    client: &reqwest::Client,
    url: &str,
    dateobs: DateObs,
    policy: &FetchPolicy,
) -> Result<HealpixMap, AcquisitionError> {
    let mut attempt = 0u32;
    let payload = loop {
        match try_fetch(client, url).await {
            Ok(payload) => break payload,
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                attempt += 1;
                warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %err,
                    "map fetch failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                return Err(AcquisitionError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    };
    debug!(url, tiles = payload.uniq.len(), "map downloaded");
    Ok(HealpixMap::from_payload(fetch_map_name(url), dateobs, payload)?)
}

async fn try_fetch(
    client: &reqwest::Client,
    url: &str,
) -> Result<MapPayload, AcquisitionError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| AcquisitionError::Request {
            url: url.to_string(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(AcquisitionError::Status {
            url: url.to_string(),
            status,
        });
    }
    response
        .json::<MapPayload>()
        .await
        .map_err(|source| AcquisitionError::Decode {
            url: url.to_string(),
            source,
        })
}

/// Map name for a downloaded resource: the last path segment of its URL.
pub fn fetch_map_name(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

/// Map name for a synthesized cone, fixed five-decimal encoding of its
/// parameters.
pub fn cone_map_name(ra: f64, dec: f64, error: f64) -> String {
    format!("{ra:.5}_{dec:.5}_{error:.5}")
}

/// Synthesize a Gaussian probability map around (`ra`, `dec`) with the
/// given 1-sigma radius, all in degrees.
///
/// Resolution is the coarsest order whose mean pixel spacing is at most
/// `error / 16`; tiles cover every pixel whose center lies within four
/// error radii. Densities follow `exp(-(sep / error)^2 / 2)` and are
/// rescaled so the probability integrated over the tile solid angles is
/// exactly one.
pub fn synthesize_cone(
    ra: f64,
    dec: f64,
    error: f64,
    dateobs: DateObs,
) -> Result<HealpixMap, MapError> {
    let order = healpix::order_for_spacing((error / 16.0).to_radians());
    let pixels = healpix::query_disc(order, ra, dec, 4.0 * error);
    let area = healpix::pixel_area(order);

    let mut densities: Vec<f64> = pixels
        .iter()
        .map(|&pix| {
            let (pra, pdec) = healpix::pix_to_ang(order, pix);
            let sep = healpix::angular_separation(ra, dec, pra, pdec);
            (-0.5 * (sep / error).powi(2)).exp()
        })
        .collect();
    let total: f64 = densities.iter().map(|d| d * area).sum();
    for density in &mut densities {
        *density /= total;
    }

    let payload = MapPayload {
        uniq: pixels
            .iter()
            .map(|&pix| healpix::nest_to_uniq(order, pix))
            .collect(),
        probdensity: densities,
        distmu: None,
        distsigma: None,
        distnorm: None,
    };
    HealpixMap::from_payload(cone_map_name(ra, dec, error), dateobs, payload)
}
