//! Tiling and plan generation.
//!
//! The coverage optimizer sits behind [`TileAllocator`], so external
//! schedulers can replace the built-in [`GreedyAllocator`] without touching
//! the plan lifecycle. [`generate_plan`] owns that lifecycle: it rejects
//! name collisions up front, creates the plan in `Working`, runs the
//! allocator, and attaches the translated observations while advancing to
//! `Ready` in one terminal repository call. An allocator failure therefore
//! leaves a visible `Working` plan rather than losing the request.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

use crate::api::{DateObs, FieldId, Filter};
use crate::config::AppConfig;
use crate::db::{FullRepository, RepositoryError};
use crate::healpix;
use crate::models::plan::{FilterScheduleType, ScheduleStrategy};
use crate::models::{
    Field, Galaxy, ModifiedJulianDate, Plan, PlanArgs, PlanError, PlannedObservation, Telescope,
    WORKING_ORDER,
};

/// Static tessellation ids stay below this; fields synthesized by the
/// catalog strategy are keyed above it, deterministically per galaxy, so
/// repeated generation merges onto the same rows.
pub const ADHOC_FIELD_BASE: i64 = 1_000_000;

/// Everything an allocator needs to plan coverage for one telescope.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub dateobs: DateObs,
    pub telescope: Telescope,
    /// Probability per pixel at the working resolution.
    pub flat: Vec<f64>,
    /// The telescope's known fields.
    pub fields: Vec<Field>,
    /// Galaxy catalog for the catalog strategy.
    pub galaxies: Vec<Galaxy>,
    /// Normalized arguments (dither doubling already applied).
    pub args: PlanArgs,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// One scheduled exposure produced by an allocator.
#[derive(Debug, Clone)]
pub struct AllocatedExposure {
    pub field_id: FieldId,
    pub filter: Filter,
    pub obstime: DateTime<Utc>,
    pub exposure_time: f64,
    /// Enclosed probability of the field's footprint.
    pub weight: f64,
}

/// Allocator output: scheduled exposures plus any fields the strategy
/// synthesized along the way.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub exposures: Vec<AllocatedExposure>,
    pub new_fields: Vec<Field>,
}

/// Boundary to the coverage optimizer. Implementations are deterministic
/// given the request; failures are surfaced, never retried.
#[async_trait]
pub trait TileAllocator: Send + Sync {
    async fn allocate(&self, request: &AllocationRequest) -> anyhow::Result<Allocation>;
}

#[derive(Debug, Error)]
pub enum PlanGenerationError {
    #[error("unknown telescope {0}")]
    UnknownTelescope(String),
    #[error("telescope {telescope} has no {filter} filter")]
    UnsupportedFilter { telescope: String, filter: Filter },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("allocator failed: {0}")]
    Allocator(#[from] anyhow::Error),
}

/// Parameters for one plan-generation run. Only the event, telescope and
/// map are required; everything else falls back to telescope defaults.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub dateobs: DateObs,
    pub telescope: String,
    pub map_name: String,
    /// Defaults to the canonical name derived from the normalized args.
    pub plan_name: Option<String>,
    /// Defaults to the telescope's configured arguments.
    pub args: Option<PlanArgs>,
    /// Defaults to the event time.
    pub validity_window_start: Option<DateTime<Utc>>,
    /// Defaults to one day past the window start.
    pub validity_window_end: Option<DateTime<Utc>>,
}

impl PlanRequest {
    pub fn new(
        dateobs: DateObs,
        telescope: impl Into<String>,
        map_name: impl Into<String>,
    ) -> Self {
        Self {
            dateobs,
            telescope: telescope.into(),
            map_name: map_name.into(),
            plan_name: None,
            args: None,
            validity_window_start: None,
            validity_window_end: None,
        }
    }
}

/// Generate one observing plan.
///
/// The stored plan keeps the caller's arguments (plus the derived `tobs`
/// offsets); the allocator sees the normalized copy, where telescopes that
/// expand dithers downstream get doubled exposure times. The default plan
/// name is derived from the normalized copy.
pub async fn generate_plan<R, A>(
    repo: &R,
    allocator: &A,
    config: &AppConfig,
    request: PlanRequest,
) -> Result<Plan, PlanGenerationError>
where
    R: FullRepository + ?Sized,
    A: TileAllocator + ?Sized,
{
    let telescope = config
        .telescope(&request.telescope)
        .ok_or_else(|| PlanGenerationError::UnknownTelescope(request.telescope.clone()))?
        .clone();

    let window_start = request
        .validity_window_start
        .unwrap_or_else(|| request.dateobs.datetime());
    let window_end = request
        .validity_window_end
        .unwrap_or_else(|| window_start + Duration::days(1));

    let mut stored_args = request
        .args
        .unwrap_or_else(|| telescope.default_plan_args.clone());
    for &filter in &stored_args.filters {
        if !telescope.filters.contains(&filter) {
            return Err(PlanGenerationError::UnsupportedFilter {
                telescope: telescope.name.clone(),
                filter,
            });
        }
    }
    let event_mjd = request.dateobs.to_mjd().value();
    if stored_args.tobs.is_none() {
        stored_args.tobs = Some([
            ModifiedJulianDate::from_datetime(window_start).value() - event_mjd,
            ModifiedJulianDate::from_datetime(window_end).value() - event_mjd,
        ]);
    }

    let mut args = stored_args.clone();
    if telescope.expand_dithers && args.do_dither {
        for exposure in &mut args.exposure_times {
            *exposure *= 2.0;
        }
    }
    let plan_name = request
        .plan_name
        .clone()
        .unwrap_or_else(|| args.default_plan_name());

    let map = repo
        .get_localization(request.dateobs, &request.map_name)
        .await?;
    let plan = Plan::new(
        request.dateobs,
        &telescope.name,
        &plan_name,
        &request.map_name,
        window_start,
        window_end,
        stored_args,
    );
    // Name collisions are rejected here, before any allocator work.
    repo.create_plan(&plan).await?;
    info!(dateobs = %request.dateobs, telescope = %telescope.name, plan = %plan_name,
        map = %request.map_name, "generating plan");

    let alloc_request = AllocationRequest {
        dateobs: request.dateobs,
        telescope: telescope.clone(),
        flat: map.flatten(WORKING_ORDER),
        fields: repo.fields_for(&telescope.name).await?,
        galaxies: config.galaxies.clone(),
        args: args.clone(),
        window_start,
        window_end,
    };
    let allocation = allocator.allocate(&alloc_request).await?;

    if !allocation.new_fields.is_empty() {
        let merged = repo.merge_fields(&allocation.new_fields).await?;
        debug!(telescope = %telescope.name, merged, "catalog fields merged");
    }
    let field_index: HashMap<FieldId, Field> = repo
        .fields_for(&telescope.name)
        .await?
        .into_iter()
        .map(|f| (f.field_id, f))
        .collect();

    let mut observations: Vec<PlannedObservation> =
        Vec::with_capacity(allocation.exposures.len());
    for exposure in &allocation.exposures {
        let field = field_index
            .get(&exposure.field_id)
            .ok_or(PlanError::UnknownField(exposure.field_id))?;
        if args.do_references && !field.has_reference(exposure.filter) {
            continue;
        }
        if exposure.filter.code().is_none() {
            return Err(PlanError::UnknownFilterCode(exposure.filter).into());
        }
        observations.push(PlannedObservation {
            planned_observation_id: observations.len() as i64,
            field_id: exposure.field_id,
            filter: exposure.filter,
            obstime: exposure.obstime,
            exposure_time: exposure.exposure_time,
            overhead_per_exposure: telescope.overhead_per_exposure,
            weight: exposure.weight,
        });
    }

    let done = repo
        .complete_plan(request.dateobs, &telescope.name, &plan_name, observations)
        .await?;
    info!(dateobs = %request.dateobs, telescope = %telescope.name, plan = %plan_name,
        observations = done.num_observations(), "plan ready");
    Ok(done)
}

/// Built-in allocator: greedy marginal-probability field selection, then a
/// sequential schedule honoring filter interleaving, the repeat-visit gap
/// and an airmass gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyAllocator;

#[async_trait]
impl TileAllocator for GreedyAllocator {
    async fn allocate(&self, request: &AllocationRequest) -> anyhow::Result<Allocation> {
        let mut new_fields = Vec::new();
        let pool: Vec<Field> = match request.args.strategy {
            ScheduleStrategy::Tiling => request
                .fields
                .iter()
                .filter(|f| f.field_id.0 < ADHOC_FIELD_BASE)
                .cloned()
                .collect(),
            ScheduleStrategy::Catalog => {
                // Galaxy pointings only: previously merged ad-hoc fields
                // plus whatever this run synthesizes.
                let mut pool: Vec<Field> = request
                    .fields
                    .iter()
                    .filter(|f| f.field_id.0 >= ADHOC_FIELD_BASE)
                    .cloned()
                    .collect();
                new_fields = synthesize_catalog_fields(request, &pool);
                pool.extend(new_fields.iter().cloned());
                pool
            }
        };

        let selected = select_fields(&request.flat, &pool, request.args.probability);
        debug!(telescope = %request.telescope.name, candidates = pool.len(),
            selected = selected.len(), "fields selected");
        let exposures = schedule_exposures(request, &selected);
        Ok(Allocation {
            exposures,
            new_fields,
        })
    }
}

/// Greedy coverage: repeatedly take the field with the highest probability
/// over still-unclaimed pixels until the claimed total reaches `target` or
/// no field adds anything.
fn select_fields<'a>(flat: &[f64], fields: &'a [Field], target: f64) -> Vec<&'a Field> {
    let mut claimed = vec![false; flat.len()];
    let mut remaining: Vec<&Field> = fields.iter().collect();
    let mut selected = Vec::new();
    let mut covered = 0.0;

    while covered < target && !remaining.is_empty() {
        let gains: Vec<f64> = remaining
            .iter()
            .map(|f| {
                f.ipix
                    .iter()
                    .filter(|&&p| !claimed[p as usize])
                    .map(|&p| flat[p as usize])
                    .sum()
            })
            .collect();
        let (best, &best_gain) = match gains
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            Some(found) => found,
            None => break,
        };
        if best_gain <= 0.0 {
            break;
        }
        let field = remaining.swap_remove(best);
        for &p in &field.ipix {
            claimed[p as usize] = true;
        }
        covered += best_gain;
        selected.push(field);
    }
    selected
}

/// Synthesize one field per galaxy worth pointing at, ranked by local
/// probability density times catalog weight. Galaxies whose ad-hoc field
/// already exists are skipped.
fn synthesize_catalog_fields(request: &AllocationRequest, existing: &[Field]) -> Vec<Field> {
    let known: HashSet<i64> = existing.iter().map(|f| f.field_id.0).collect();
    let mut ranked: Vec<(usize, f64)> = request
        .galaxies
        .iter()
        .enumerate()
        .map(|(i, g)| {
            let pix = healpix::ang_to_pix(WORKING_ORDER, g.ra.value(), g.dec.value());
            (i, request.flat[pix as usize] * g.weight)
        })
        .filter(|&(_, score)| score > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    ranked
        .into_iter()
        .filter(|&(i, _)| !known.contains(&(ADHOC_FIELD_BASE + i as i64)))
        .map(|(i, _)| {
            let galaxy = &request.galaxies[i];
            Field::from_center(
                &request.telescope.name,
                FieldId(ADHOC_FIELD_BASE + i as i64),
                galaxy.ra,
                galaxy.dec,
                request.telescope.fov,
                WORKING_ORDER,
            )
        })
        .collect()
}

/// Lay the selected fields out in time. Each filter pass walks the fields
/// in selection order; block interleaving repeats one filter per pass,
/// integrated interleaving rotates the filter sequence across fields so
/// every pass mixes them. A field is skipped in a pass when its airmass at
/// the scheduled instant exceeds the limit or the window has run out.
fn schedule_exposures(
    request: &AllocationRequest,
    selected: &[&Field],
) -> Vec<AllocatedExposure> {
    let args = &request.args;
    if args.filters.is_empty() {
        return Vec::new();
    }
    let passes = args.filters.len();
    let min_gap = Duration::milliseconds((args.min_time_between * 1000.0) as i64);
    let overhead = request.telescope.overhead_per_exposure;

    let mut cursor = request.window_start;
    let mut last_visit: HashMap<FieldId, DateTime<Utc>> = HashMap::new();
    let mut out = Vec::new();

    for pass in 0..passes {
        for (slot, field) in selected.iter().enumerate() {
            let filter_index = match args.filter_schedule {
                FilterScheduleType::Block => pass,
                FilterScheduleType::Integrated => (slot + pass) % passes,
            };
            let filter = args.filters[filter_index];
            let exposure = args.exposure_for(filter_index);

            let mut at = cursor;
            if let Some(&prev) = last_visit.get(&field.field_id) {
                let earliest = prev + min_gap;
                if at < earliest {
                    at = earliest;
                }
            }
            let finished =
                at + Duration::milliseconds(((exposure + overhead) * 1000.0) as i64);
            if finished > request.window_end {
                continue;
            }
            if airmass(&request.telescope, field.ra.value(), field.dec.value(), at)
                > args.airmass_limit
            {
                continue;
            }

            out.push(AllocatedExposure {
                field_id: field.field_id,
                filter,
                obstime: at,
                exposure_time: exposure,
                weight: field.enclosed_probability(&request.flat),
            });
            last_visit.insert(field.field_id, at);
            cursor = finished;
        }
    }
    out
}

/// Airmass (sec z) of a position seen from the telescope site at an
/// instant; below-horizon positions return infinity.
fn airmass(telescope: &Telescope, ra: f64, dec: f64, at: DateTime<Utc>) -> f64 {
    let jd = ModifiedJulianDate::from_datetime(at).value() + 2400000.5;
    let gmst = (280.46061837 + 360.98564736629 * (jd - 2451545.0)).rem_euclid(360.0);
    let lst = (gmst + telescope.longitude.value()).rem_euclid(360.0);
    let hour_angle = (lst - ra).to_radians();
    let lat = telescope.latitude.value().to_radians();
    let dec = dec.to_radians();
    let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * hour_angle.cos();
    if sin_alt <= 0.0 {
        f64::INFINITY
    } else {
        1.0 / sin_alt
    }
}
