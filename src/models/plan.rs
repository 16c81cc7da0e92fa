//! Observing plans and their planned observations.
//!
//! A plan is keyed by (event, telescope, name) and moves strictly forward
//! through `Working` → `Ready` → `Submitted`. It is created `Working` before
//! the tile allocator runs, receives its observations and becomes `Ready` in
//! a single terminal update, and is marked `Submitted` after dispatch to the
//! telescope's scheduler backend. Derived views (export, summary) refuse to
//! serve a plan that is still generating.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

use crate::api::{
    DateObs, FieldId, Filter, FlatExposure, PlanExport, PlanSummary, QueueTarget,
};
use crate::healpix;
use crate::models::skymap::WORKING_ORDER;
use crate::models::telescope::Field;

/// Program identifier stamped on every exported queue target.
pub const PROGRAM_ID: i64 = 2;

/// Buffer added after the last exposure when computing the export validity
/// window, in minutes.
const EXPORT_END_BUFFER_MIN: i64 = 30;

/// Plan lifecycle state. The numeric order is meaningful: a plan at or past
/// `Ready` has its full observation list attached.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Working = 0,
    Ready = 1,
    Submitted = 2,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Working => "working",
            PlanStatus::Ready => "ready",
            PlanStatus::Submitted => "submitted",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by plan-level views and exports.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan exists but has not finished generating.
    #[error("plan '{0}' is still generating")]
    NotReady(String),
    /// The filter has no entry in the scheduler code table.
    #[error("filter '{0}' has no scheduler filter code")]
    UnknownFilterCode(Filter),
    /// A planned observation references a field the telescope does not have.
    #[error("field {0} is not known for this telescope")]
    UnknownField(FieldId),
}

/// How filters are interleaved across the observing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScheduleType {
    /// One pass per filter: every selected field in filter A, then B, ...
    Block,
    /// Filters rotate within each pass so consecutive exposures mix filters.
    Integrated,
}

impl fmt::Display for FilterScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterScheduleType::Block => "block",
            FilterScheduleType::Integrated => "integrated",
        })
    }
}

/// Which pointings the allocator draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStrategy {
    /// The telescope's static sky tessellation.
    Tiling,
    /// Ad-hoc pointings centered on weighted catalog galaxies.
    Catalog,
}

impl fmt::Display for ScheduleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScheduleStrategy::Tiling => "tiling",
            ScheduleStrategy::Catalog => "catalog",
        })
    }
}

/// Plan-generation arguments. Every field has a default so a request can
/// supply any subset; telescopes carry their own preferred bag which the
/// automated pipeline uses unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanArgs {
    /// Ordered filter sequence, repeats allowed.
    pub filters: Vec<Filter>,
    /// Exposure time in seconds per entry of `filters`; a short list is
    /// padded with its first value.
    pub exposure_times: Vec<f64>,
    /// Cumulative probability to tile out to.
    pub probability: f64,
    /// Maximum airmass an exposure may be scheduled at.
    pub airmass_limit: f64,
    /// Minimum separation between repeat visits of one field, in seconds.
    pub min_time_between: f64,
    /// Allocator ranking policy, passed through to the allocator.
    pub schedule_type: String,
    pub filter_schedule: FilterScheduleType,
    pub strategy: ScheduleStrategy,
    pub do_dither: bool,
    /// Only schedule (and export) exposures whose field has a reference
    /// image in that filter.
    pub do_references: bool,
    /// Observation window as [start, end] day offsets from the event time.
    /// Defaults to the plan's validity window.
    pub tobs: Option<[f64; 2]>,
}

impl Default for PlanArgs {
    fn default() -> Self {
        PlanArgs {
            filters: vec![Filter::R],
            exposure_times: vec![60.0],
            probability: 0.9,
            airmass_limit: 2.5,
            min_time_between: 30.0 * 60.0,
            schedule_type: "greedy".to_string(),
            filter_schedule: FilterScheduleType::Block,
            strategy: ScheduleStrategy::Tiling,
            do_dither: false,
            do_references: false,
            tobs: None,
        }
    }
}

impl PlanArgs {
    /// Exposure time for the filter at `index`, padding short lists with
    /// the first entry.
    pub fn exposure_for(&self, index: usize) -> f64 {
        self.exposure_times
            .get(index)
            .or_else(|| self.exposure_times.first())
            .copied()
            .unwrap_or(60.0)
    }

    /// Canonical auto-generated plan name, e.g. `grg_greedy_0_1_block_300_90`.
    pub fn default_plan_name(&self) -> String {
        let filters: String = self.filters.iter().map(Filter::as_str).collect();
        format!(
            "{}_{}_{}_{}_{}_{}_{}",
            filters,
            self.schedule_type,
            u8::from(self.do_dither),
            u8::from(self.do_references),
            self.filter_schedule,
            self.exposure_for(0) as i64,
            (100.0 * self.probability).round() as i64,
        )
    }
}

/// One scheduled exposure of one field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedObservation {
    pub planned_observation_id: i64,
    pub field_id: FieldId,
    pub filter: Filter,
    /// Scheduled start of the exposure.
    pub obstime: DateTime<Utc>,
    /// Shutter-open time in seconds.
    pub exposure_time: f64,
    /// Readout and slew overhead in seconds.
    pub overhead_per_exposure: f64,
    /// Probability enclosed by the observed field.
    pub weight: f64,
}

impl PlannedObservation {
    /// End of the exposure including overhead.
    pub fn end(&self) -> DateTime<Utc> {
        self.obstime
            + Duration::milliseconds(
                ((self.exposure_time + self.overhead_per_exposure) * 1e3) as i64,
            )
    }
}

/// An observing plan for one telescope and one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub dateobs: DateObs,
    pub telescope: String,
    pub plan_name: String,
    /// Name of the probability map the plan was cut from.
    pub localization_name: String,
    pub validity_window_start: DateTime<Utc>,
    pub validity_window_end: DateTime<Utc>,
    pub plan_args: PlanArgs,
    pub status: PlanStatus,
    pub planned_observations: Vec<PlannedObservation>,
}

impl Plan {
    /// A freshly created plan: `Working`, no observations yet.
    pub fn new(
        dateobs: DateObs,
        telescope: impl Into<String>,
        plan_name: impl Into<String>,
        localization_name: impl Into<String>,
        validity_window_start: DateTime<Utc>,
        validity_window_end: DateTime<Utc>,
        plan_args: PlanArgs,
    ) -> Self {
        Plan {
            dateobs,
            telescope: telescope.into(),
            plan_name: plan_name.into(),
            localization_name: localization_name.into(),
            validity_window_start,
            validity_window_end,
            plan_args,
            status: PlanStatus::Working,
            planned_observations: Vec::new(),
        }
    }

    pub fn num_observations(&self) -> usize {
        self.planned_observations.len()
    }

    /// Total open-shutter time in seconds.
    pub fn total_time(&self) -> f64 {
        self.planned_observations
            .iter()
            .map(|o| o.exposure_time)
            .sum()
    }

    /// Total time including per-exposure overheads, in seconds.
    pub fn tot_time_with_overheads(&self) -> f64 {
        self.planned_observations
            .iter()
            .map(|o| o.exposure_time + o.overhead_per_exposure)
            .sum()
    }

    /// Start of the earliest exposure, or the validity-window start for an
    /// empty plan.
    pub fn start_observation(&self) -> DateTime<Utc> {
        self.planned_observations
            .iter()
            .map(|o| o.obstime)
            .min()
            .unwrap_or(self.validity_window_start)
    }

    /// End of the latest exposure including overhead, or the
    /// validity-window end for an empty plan.
    pub fn end_observation(&self) -> DateTime<Utc> {
        self.planned_observations
            .iter()
            .map(|o| o.end())
            .max()
            .unwrap_or(self.validity_window_end)
    }

    /// Distinct working-resolution pixels covered by the plan's fields.
    pub fn ipix(&self, fields: &HashMap<FieldId, Field>) -> BTreeSet<u64> {
        let observed: BTreeSet<FieldId> = self
            .planned_observations
            .iter()
            .map(|o| o.field_id)
            .collect();
        observed
            .iter()
            .filter_map(|id| fields.get(id))
            .flat_map(|f| f.ipix.iter().copied())
            .collect()
    }

    /// Queue name for scheduler submission:
    /// `ToO_{dateobs}_{plan_name}_{start}_{end}` with dashed timestamps.
    pub fn queue_name(&self) -> String {
        format!(
            "ToO_{}_{}_{}_{}",
            dashed(self.dateobs.datetime()),
            self.plan_name,
            dashed(self.validity_window_start),
            dashed(self.validity_window_end),
        )
    }

    /// Subprogram name tying the submission back to the alert stream:
    /// `ToO_{stream}_{dateobs}`.
    pub fn subprogram_name(&self, stream: &str) -> String {
        format!("ToO_{}_{}", stream, dashed(self.dateobs.datetime()))
    }

    fn ensure_ready(&self) -> Result<(), PlanError> {
        if self.status < PlanStatus::Ready {
            return Err(PlanError::NotReady(self.plan_name.clone()));
        }
        Ok(())
    }

    /// Aggregate statistics over the plan's distinct fields. `flat` is the
    /// event map flattened to the working resolution.
    pub fn summary(
        &self,
        fields: &HashMap<FieldId, Field>,
        flat: &[f64],
    ) -> Result<PlanSummary, PlanError> {
        self.ensure_ready()?;
        let ipix = self.ipix(fields);
        let pixel_area_deg2 =
            healpix::pixel_area(WORKING_ORDER) * (180.0 / std::f64::consts::PI).powi(2);
        let probability = ipix
            .iter()
            .filter_map(|&p| flat.get(p as usize))
            .sum::<f64>();
        Ok(PlanSummary {
            num_observations: self.num_observations(),
            total_time: self.tot_time_with_overheads(),
            area: pixel_area_deg2 * ipix.len() as f64,
            probability,
            status: self.status,
        })
    }

    /// Queue-format export. `stream` is the alert stream of the event's
    /// latest notice; `program_pi` comes from the telescope configuration.
    ///
    /// Exposure times are divided by the dither norm (2 for dithered plans)
    /// so the backend's own dither expansion restores the requested total.
    /// When the plan requires references, targets whose field lacks a
    /// reference image in the exposure's filter are dropped; surviving
    /// targets keep their original request index.
    pub fn export(
        &self,
        stream: &str,
        program_pi: &str,
        fields: &HashMap<FieldId, Field>,
    ) -> Result<PlanExport, PlanError> {
        self.ensure_ready()?;
        let dither_norm = if self.plan_args.do_dither { 2.0 } else { 1.0 };
        let subprogram_name = self.subprogram_name(stream);

        let mut targets = Vec::with_capacity(self.planned_observations.len());
        for (ii, obs) in self.planned_observations.iter().enumerate() {
            let field = fields
                .get(&obs.field_id)
                .ok_or(PlanError::UnknownField(obs.field_id))?;
            if self.plan_args.do_references && !field.has_reference(obs.filter) {
                continue;
            }
            let filter_id = obs
                .filter
                .code()
                .ok_or(PlanError::UnknownFilterCode(obs.filter))?;
            targets.push(QueueTarget {
                request_id: ii as i64,
                program_id: PROGRAM_ID,
                field_id: obs.field_id.value(),
                ra: field.ra,
                dec: field.dec,
                filter_id,
                exposure_time: obs.exposure_time / dither_norm,
                program_pi: program_pi.to_string(),
                subprogram_name: subprogram_name.clone(),
            });
        }

        let start_mjd = crate::models::ModifiedJulianDate::from_datetime(
            self.start_observation(),
        )
        .value();
        let end_mjd = crate::models::ModifiedJulianDate::from_datetime(
            self.end_observation() + Duration::minutes(EXPORT_END_BUFFER_MIN),
        )
        .value();

        Ok(PlanExport {
            queue_name: self.queue_name(),
            validity_window_mjd: [start_mjd, end_mjd],
            targets,
        })
    }

    /// Flat per-exposure rows for file-drop backends. With `expand_dithers`
    /// and a dithered plan, each target becomes two rows, the second offset
    /// by +60 arcsec in both coordinates. Reference filtering and the dither
    /// norm apply exactly as in [`Plan::export`].
    pub fn flat_exposures(
        &self,
        stream: &str,
        fields: &HashMap<FieldId, Field>,
        expand_dithers: bool,
    ) -> Result<Vec<FlatExposure>, PlanError> {
        self.ensure_ready()?;
        let dither_norm = if self.plan_args.do_dither { 2.0 } else { 1.0 };
        let queue_name = self.queue_name();
        let subprogram_name = self.subprogram_name(stream);
        let per_target = if expand_dithers && self.plan_args.do_dither {
            2
        } else {
            1
        };
        let dither_step = 60.0 / 3600.0;

        let mut retained = Vec::new();
        for obs in &self.planned_observations {
            let field = fields
                .get(&obs.field_id)
                .ok_or(PlanError::UnknownField(obs.field_id))?;
            if self.plan_args.do_references && !field.has_reference(obs.filter) {
                continue;
            }
            if obs.filter.code().is_none() {
                return Err(PlanError::UnknownFilterCode(obs.filter));
            }
            retained.push((obs, field));
        }

        let seqtot = retained.len() * per_target;
        let mut rows = Vec::with_capacity(seqtot);
        for (obs, field) in retained {
            for dither in 0..per_target {
                let offset = dither as f64 * dither_step;
                rows.push(FlatExposure {
                    queue_name: queue_name.clone(),
                    seqnum: rows.len() + 1,
                    seqtot,
                    field_id: obs.field_id.value(),
                    ra: qtty::Degrees::new(field.ra.value() + offset),
                    dec: qtty::Degrees::new(field.dec.value() + offset),
                    filter: obs.filter,
                    exposure_time: obs.exposure_time / dither_norm,
                    subprogram_name: subprogram_name.clone(),
                });
            }
        }
        Ok(rows)
    }
}

fn dashed(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d-%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telescope::FieldOfView;

    fn sample_field(id: i64, ra: f64, dec: f64, refs: &[Filter]) -> Field {
        let mut field = Field::from_center(
            "ZTF",
            FieldId::new(id),
            qtty::Degrees::new(ra),
            qtty::Degrees::new(dec),
            FieldOfView::Square {
                side: qtty::Degrees::new(7.0),
            },
            5,
        );
        field.reference_filters = refs.to_vec();
        field
    }

    fn sample_plan() -> (Plan, HashMap<FieldId, Field>) {
        let dateobs: DateObs = "2019-04-25T08:18:05".parse().unwrap();
        let start = dateobs.datetime();
        let mut plan = Plan::new(
            dateobs,
            "ZTF",
            "grg_greedy_0_1_block_300_90",
            "bayestar.fits.gz",
            start,
            start + Duration::days(1),
            PlanArgs {
                filters: vec![Filter::G, Filter::R],
                exposure_times: vec![300.0, 300.0],
                do_references: true,
                ..PlanArgs::default()
            },
        );
        plan.planned_observations = vec![
            PlannedObservation {
                planned_observation_id: 0,
                field_id: FieldId::new(1),
                filter: Filter::G,
                obstime: start + Duration::hours(1),
                exposure_time: 300.0,
                overhead_per_exposure: 10.0,
                weight: 0.2,
            },
            PlannedObservation {
                planned_observation_id: 1,
                field_id: FieldId::new(2),
                filter: Filter::Z,
                obstime: start + Duration::hours(2),
                exposure_time: 300.0,
                overhead_per_exposure: 10.0,
                weight: 0.1,
            },
        ];
        plan.status = PlanStatus::Ready;

        let fields: HashMap<FieldId, Field> = [
            sample_field(1, 30.0, 10.0, &[Filter::G, Filter::R]),
            sample_field(2, 37.0, 10.0, &[Filter::G, Filter::R]),
        ]
        .into_iter()
        .map(|f| (f.field_id, f))
        .collect();
        (plan, fields)
    }

    #[test]
    fn status_order_is_strictly_forward() {
        assert!(PlanStatus::Working < PlanStatus::Ready);
        assert!(PlanStatus::Ready < PlanStatus::Submitted);
        assert_eq!(
            serde_json::to_string(&PlanStatus::Ready).unwrap(),
            "\"ready\""
        );
    }

    #[test]
    fn default_plan_name_encodes_arguments() {
        let args = PlanArgs {
            filters: vec![Filter::G, Filter::R, Filter::G],
            exposure_times: vec![300.0, 300.0, 300.0],
            do_references: true,
            ..PlanArgs::default()
        };
        assert_eq!(args.default_plan_name(), "grg_greedy_0_1_block_300_90");

        let args = PlanArgs {
            filters: vec![Filter::G, Filter::Z],
            exposure_times: vec![25.0, 25.0],
            schedule_type: "greedy_slew".to_string(),
            filter_schedule: FilterScheduleType::Integrated,
            do_dither: true,
            do_references: true,
            ..PlanArgs::default()
        };
        assert_eq!(args.default_plan_name(), "gz_greedy_slew_1_1_integrated_25_90");
    }

    #[test]
    fn plan_args_deserialize_with_defaults() {
        let args: PlanArgs = serde_json::from_str("{}").unwrap();
        assert_eq!(args, PlanArgs::default());

        let args: PlanArgs =
            serde_json::from_str(r#"{"filters": ["g", "z"], "probability": 0.5}"#).unwrap();
        assert_eq!(args.filters, vec![Filter::G, Filter::Z]);
        assert!((args.probability - 0.5).abs() < 1e-12);
        assert_eq!(args.filter_schedule, FilterScheduleType::Block);
    }

    #[test]
    fn queue_name_uses_dashed_timestamps() {
        let (plan, _) = sample_plan();
        assert_eq!(
            plan.queue_name(),
            "ToO_2019-04-25-08:18:05_grg_greedy_0_1_block_300_90_\
             2019-04-25-08:18:05_2019-04-26-08:18:05"
        );
        assert_eq!(
            plan.subprogram_name("LVC"),
            "ToO_LVC_2019-04-25-08:18:05"
        );
    }

    #[test]
    fn export_rejects_working_plan() {
        let (mut plan, fields) = sample_plan();
        plan.status = PlanStatus::Working;
        assert!(matches!(
            plan.export("LVC", "Kulkarni", &fields),
            Err(PlanError::NotReady(_))
        ));
        assert!(matches!(
            plan.summary(&fields, &[]),
            Err(PlanError::NotReady(_))
        ));
    }

    #[test]
    fn export_drops_targets_without_reference() {
        let (plan, fields) = sample_plan();
        let export = plan.export("LVC", "Kulkarni", &fields).unwrap();
        // The z-band exposure has no z reference; only the g target remains,
        // keeping its original request index.
        assert_eq!(export.targets.len(), 1);
        assert_eq!(export.targets[0].request_id, 0);
        assert_eq!(export.targets[0].filter_id, 1);
        assert_eq!(export.targets[0].program_id, PROGRAM_ID);

        let mut relaxed = plan.clone();
        relaxed.plan_args.do_references = false;
        let export = relaxed.export("LVC", "Kulkarni", &fields).unwrap();
        assert_eq!(export.targets.len(), 2);
        assert_eq!(export.targets[1].request_id, 1);
        assert_eq!(export.targets[1].filter_id, 4);
    }

    #[test]
    fn export_window_covers_observations_plus_buffer() {
        let (plan, fields) = sample_plan();
        let export = plan.export("LVC", "Kulkarni", &fields).unwrap();
        let start = crate::models::ModifiedJulianDate::from_datetime(
            plan.planned_observations[0].obstime,
        )
        .value();
        let end = crate::models::ModifiedJulianDate::from_datetime(
            plan.planned_observations[1].end() + Duration::minutes(30),
        )
        .value();
        assert!((export.validity_window_mjd[0] - start).abs() < 1e-9);
        assert!((export.validity_window_mjd[1] - end).abs() < 1e-9);
    }

    #[test]
    fn dithered_export_halves_exposures_and_doubles_rows() {
        let (mut plan, fields) = sample_plan();
        plan.plan_args.do_dither = true;
        plan.plan_args.do_references = false;
        let export = plan.export("LVC", "Andreoni/Goldstein", &fields).unwrap();
        assert!((export.targets[0].exposure_time - 150.0).abs() < 1e-12);

        let rows = plan.flat_exposures("LVC", &fields, true).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].seqnum, 1);
        assert_eq!(rows[3].seqnum, 4);
        assert!(rows.iter().all(|r| r.seqtot == 4));
        let offset = 60.0 / 3600.0;
        assert!((rows[1].ra.value() - rows[0].ra.value() - offset).abs() < 1e-12);
        assert!((rows[1].dec.value() - rows[0].dec.value() - offset).abs() < 1e-12);
    }

    #[test]
    fn summary_reports_area_and_probability() {
        let dateobs: DateObs = "2019-04-25T08:18:05".parse().unwrap();
        let start = dateobs.datetime();
        let mut field = Field::from_center(
            "ZTF",
            FieldId::new(1),
            qtty::Degrees::new(30.0),
            qtty::Degrees::new(10.0),
            FieldOfView::Square {
                side: qtty::Degrees::new(7.0),
            },
            WORKING_ORDER,
        );
        field.reference_filters = vec![Filter::G];
        let npix = healpix::npix(WORKING_ORDER) as usize;
        let mut flat = vec![0.0; npix];
        for &p in &field.ipix {
            flat[p as usize] = 1e-4;
        }

        let mut plan = Plan::new(
            dateobs,
            "ZTF",
            "test",
            "map",
            start,
            start + Duration::days(1),
            PlanArgs::default(),
        );
        // Two visits of the same field: distinct-pixel stats count it once.
        for ii in 0..2 {
            plan.planned_observations.push(PlannedObservation {
                planned_observation_id: ii,
                field_id: FieldId::new(1),
                filter: Filter::R,
                obstime: start + Duration::hours(ii),
                exposure_time: 300.0,
                overhead_per_exposure: 10.0,
                weight: 0.5,
            });
        }
        plan.status = PlanStatus::Ready;

        let fields: HashMap<FieldId, Field> =
            [(field.field_id, field.clone())].into_iter().collect();
        let summary = plan.summary(&fields, &flat).unwrap();
        assert_eq!(summary.num_observations, 2);
        assert!((summary.total_time - 620.0).abs() < 1e-9);
        let expected_prob = field.ipix.len() as f64 * 1e-4;
        assert!((summary.probability - expected_prob).abs() < 1e-12);
        let pixel_area_deg2 = healpix::pixel_area(WORKING_ORDER)
            * (180.0 / std::f64::consts::PI).powi(2);
        let expected_area = pixel_area_deg2 * field.ipix.len() as f64;
        assert!((summary.area - expected_area).abs() < 1e-9);
    }
}
