//! Telescopes, fields and footprint geometry.
//!
//! Telescope rows are static configuration: geography, filter set, field of
//! view, scheduler backend and default plan-generation arguments. Fields
//! are a telescope's tessellation of the sky; each carries its footprint
//! ring and the set of working-resolution pixels it covers, so enclosed
//! probability is a plain indexed sum.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::api::{FieldId, Filter};
use crate::healpix;
use crate::models::plan::PlanArgs;

/// Aperture geometry used to build footprints and coverage sets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum FieldOfView {
    Square { side: qtty::Degrees },
    Circle { radius: qtty::Degrees },
}

/// Output format for file-drop scheduler backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Json,
    Csv,
}

/// How submitted plans reach the telescope. Resolved once at configuration
/// load; submission dispatches on the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerBackend {
    /// PUT the exported plan to `{base_url}/queues`.
    HttpQueue { base_url: String },
    /// Write one file per plan into `dir`, named by queue name.
    FileDrop { dir: PathBuf, format: FileFormat },
}

/// Static per-telescope configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Telescope {
    pub name: String,
    pub latitude: qtty::Degrees,
    pub longitude: qtty::Degrees,
    pub elevation_m: f64,
    pub timezone: String,
    pub filters: Vec<Filter>,
    pub fov: FieldOfView,
    pub backend: SchedulerBackend,
    /// Backends that expand dithered pointings downstream get doubled
    /// exposure times at generation and per-dither rows at export.
    #[serde(default)]
    pub expand_dithers: bool,
    /// Readout and slew overhead charged per exposure, in seconds.
    #[serde(default)]
    pub overhead_per_exposure: f64,
    pub program_pi: String,
    pub default_plan_args: PlanArgs,
}

/// One entry of a galaxy catalog used by catalog-driven tiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Galaxy {
    pub name: String,
    pub ra: qtty::Degrees,
    pub dec: qtty::Degrees,
    /// Relative weight (e.g. luminosity share) applied on top of the local
    /// probability density.
    pub weight: f64,
}

/// One pointing footprint of a telescope's tessellation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    pub telescope: String,
    pub field_id: FieldId,
    pub ra: qtty::Degrees,
    pub dec: qtty::Degrees,
    /// Closed footprint ring, [ra, dec] in degrees.
    pub contour: Vec<[f64; 2]>,
    /// Covered nested pixels at the working resolution, ascending.
    pub ipix: Vec<u64>,
    /// Filters with a usable reference (template) image.
    pub reference_filters: Vec<Filter>,
    /// Limiting magnitudes parallel to `reference_filters`.
    pub reference_filter_mags: Vec<f64>,
}

impl Field {
    /// Build a field from its center using the telescope's aperture,
    /// computing footprint ring and pixel coverage at `order`.
    pub fn from_center(
        telescope: &str,
        field_id: FieldId,
        ra: qtty::Degrees,
        dec: qtty::Degrees,
        fov: FieldOfView,
        order: u8,
    ) -> Self {
        Self {
            telescope: telescope.to_string(),
            field_id,
            ra,
            dec,
            contour: footprint_ring(ra.value(), dec.value(), fov),
            ipix: coverage_pixels(ra.value(), dec.value(), fov, order),
            reference_filters: Vec::new(),
            reference_filter_mags: Vec::new(),
        }
    }

    pub fn has_reference(&self, filter: Filter) -> bool {
        self.reference_filters.contains(&filter)
    }

    /// Probability enclosed by this footprint, given the flattened map at
    /// the same resolution the coverage set was built for.
    pub fn enclosed_probability(&self, flat: &[f64]) -> f64 {
        self.ipix.iter().map(|&p| flat[p as usize]).sum()
    }
}

/// Closed footprint ring around a center. Square apertures produce their
/// corners in detector-grid order, which yields a bowtie once closed; a
/// 5-point closed ring therefore gets points 2 and 3 swapped to restore the
/// perimeter winding. Other point counts pass through untouched.
pub fn footprint_ring(ra: f64, dec: f64, fov: FieldOfView) -> Vec<[f64; 2]> {
    let mut ring: Vec<[f64; 2]> = match fov {
        FieldOfView::Square { side } => {
            let h = side.value() / 2.0;
            [(-h, -h), (h, -h), (-h, h), (h, h)]
                .iter()
                .map(|&(x, y)| inverse_gnomonic(ra, dec, x, y))
                .collect()
        }
        FieldOfView::Circle { radius } => {
            let n = 20;
            (0..n)
                .map(|i| {
                    let theta = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
                    let r = radius.value();
                    inverse_gnomonic(ra, dec, r * theta.cos(), r * theta.sin())
                })
                .collect()
        }
    };
    if let Some(&first) = ring.first() {
        ring.push(first);
    }
    if ring.len() == 5 {
        ring.swap(2, 3);
    }
    ring
}

/// Working-resolution pixels covered by an aperture centered at
/// (`ra`, `dec`): pixel centers inside the square (exact tangent-plane
/// test) or inside the circle. An aperture smaller than one pixel still
/// covers the pixel under its center.
pub fn coverage_pixels(ra: f64, dec: f64, fov: FieldOfView, order: u8) -> Vec<u64> {
    let pixels: Vec<u64> = match fov {
        FieldOfView::Square { side } => {
            let h = side.value() / 2.0;
            let margin = healpix::mean_spacing(order).to_degrees();
            let candidates =
                healpix::query_disc(order, ra, dec, h * std::f64::consts::SQRT_2 * 1.05 + margin);
            candidates
                .into_iter()
                .filter(|&p| {
                    let (pra, pdec) = healpix::pix_to_ang(order, p);
                    match gnomonic(ra, dec, pra, pdec) {
                        Some((x, y)) => x.abs() <= h && y.abs() <= h,
                        None => false,
                    }
                })
                .collect()
        }
        FieldOfView::Circle { radius } => healpix::query_disc(order, ra, dec, radius.value()),
    };
    if pixels.is_empty() {
        return vec![healpix::ang_to_pix(order, ra, dec)];
    }
    pixels
}

// Tangent-plane (gnomonic) projection centered at (ra0, dec0); offsets in
// degrees. None when the point is on the far hemisphere.
fn gnomonic(ra0: f64, dec0: f64, ra: f64, dec: f64) -> Option<(f64, f64)> {
    let (ra0, dec0, ra, dec) = (
        ra0.to_radians(),
        dec0.to_radians(),
        ra.to_radians(),
        dec.to_radians(),
    );
    let dra = ra - ra0;
    let cosc = dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * dra.cos();
    if cosc <= 0.0 {
        return None;
    }
    let x = dec.cos() * dra.sin() / cosc;
    let y = (dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * dra.cos()) / cosc;
    Some((x.to_degrees(), y.to_degrees()))
}

// Inverse gnomonic: sky position of the tangent-plane offset (x, y) in
// degrees around (ra0, dec0).
fn inverse_gnomonic(ra0: f64, dec0: f64, x: f64, y: f64) -> [f64; 2] {
    let (x, y) = (x.to_radians(), y.to_radians());
    let (ra0, dec0) = (ra0.to_radians(), dec0.to_radians());
    let rho = (x * x + y * y).sqrt();
    if rho == 0.0 {
        return [ra0.to_degrees().rem_euclid(360.0), dec0.to_degrees()];
    }
    let c = rho.atan();
    let (sinc, cosc) = c.sin_cos();
    let dec = (cosc * dec0.sin() + y * sinc * dec0.cos() / rho).asin();
    let ra = ra0
        + (x * sinc).atan2(rho * dec0.cos() * cosc - y * dec0.sin() * sinc);
    [ra.to_degrees().rem_euclid(360.0), dec.to_degrees()]
}

/// Parse a tessellation file: whitespace-separated `field_id ra dec` rows,
/// `#` comments and blank lines skipped.
pub fn parse_tessellation(text: &str) -> anyhow::Result<Vec<(i64, f64, f64)>> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (id, ra, dec) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(ra), Some(dec)) => (id, ra, dec),
            _ => bail!("line {}: expected 'field_id ra dec'", lineno + 1),
        };
        let id: i64 = id
            .parse()
            .with_context(|| format!("line {}: bad field id '{}'", lineno + 1, id))?;
        let ra: f64 = ra
            .parse()
            .with_context(|| format!("line {}: bad ra '{}'", lineno + 1, ra))?;
        let dec: f64 = dec
            .parse()
            .with_context(|| format!("line {}: bad dec '{}'", lineno + 1, dec))?;
        if !(0.0..360.0).contains(&ra) || !(-90.0..=90.0).contains(&dec) {
            bail!("line {}: coordinates out of range ({ra}, {dec})", lineno + 1);
        }
        rows.push((id, ra, dec));
    }
    Ok(rows)
}

/// Build the Field set for a telescope from tessellation rows.
pub fn fields_from_tessellation(
    telescope: &Telescope,
    rows: &[(i64, f64, f64)],
    order: u8,
) -> Vec<Field> {
    rows.iter()
        .map(|&(id, ra, dec)| {
            Field::from_center(
                &telescope.name,
                FieldId::new(id),
                qtty::Degrees::new(ra),
                qtty::Degrees::new(dec),
                telescope.fov,
                order,
            )
        })
        .collect()
}
