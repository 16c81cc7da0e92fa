//! Multiresolution sky probability maps.
//!
//! A map is a sparse set of HEALPix tiles at mixed orders, identified by
//! UNIQ values and carrying probability density per steradian. Structural
//! invariants (sorted identifiers, parallel columns, normalization) are
//! enforced at construction; a map that exists is a valid map.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{DateObs, FeatureCollection};
use crate::healpix;

/// Uniform resolution the pipeline rasterizes to for credible levels,
/// field coverage sets and probability lookups (nside 512).
pub const WORKING_ORDER: u8 = 9;

/// Relative tolerance on the unit integral of a probability map.
pub const NORMALIZATION_TOLERANCE: f64 = 1e-6;

/// Construction-time validation failures. `NotNormalized` and
/// `UnsortedUniq` on data this process produced are defects, not input
/// errors.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("map has no tiles")]
    Empty,
    #[error("uniq identifiers not strictly ascending at position {position}")]
    UnsortedUniq { position: usize },
    #[error("invalid uniq identifier {uniq} at position {position}")]
    InvalidUniq { uniq: u64, position: usize },
    #[error("column '{column}' has {got} rows, expected {expected}")]
    ColumnLength {
        column: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("non-finite or negative probability density at position {position}")]
    InvalidDensity { position: usize },
    #[error("distance columns must be all present or all absent")]
    PartialDistance,
    #[error("probability integrates to {total}, outside relative tolerance {tolerance}")]
    NotNormalized { total: f64, tolerance: f64 },
}

/// Wire form of a multiresolution map, as fetched from an external service
/// or posted through the API. Parsed rows are validated into a
/// [`HealpixMap`] before anything downstream sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapPayload {
    pub uniq: Vec<u64>,
    pub probdensity: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distmu: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distsigma: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distnorm: Option<Vec<f64>>,
}

/// A validated multiresolution probability map ("localization"), keyed by
/// (event timestamp, name). Immutable once stored except for the cached
/// contour.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealpixMap {
    pub name: String,
    pub dateobs: DateObs,
    /// Strictly ascending multiresolution identifiers.
    pub uniq: Vec<u64>,
    /// Probability density per steradian, parallel to `uniq`.
    pub probdensity: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distmu: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distsigma: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distnorm: Option<Vec<f64>>,
    /// Credible-region contour, attached lazily after computation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contour: Option<FeatureCollection>,
}

impl HealpixMap {
    /// Validate and build a map from its wire form.
    pub fn from_payload(
        name: impl Into<String>,
        dateobs: DateObs,
        payload: MapPayload,
    ) -> Result<Self, MapError> {
        let MapPayload {
            uniq,
            probdensity,
            distmu,
            distsigma,
            distnorm,
        } = payload;

        if uniq.is_empty() {
            return Err(MapError::Empty);
        }
        if probdensity.len() != uniq.len() {
            return Err(MapError::ColumnLength {
                column: "probdensity",
                got: probdensity.len(),
                expected: uniq.len(),
            });
        }
        match (&distmu, &distsigma, &distnorm) {
            (None, None, None) | (Some(_), Some(_), Some(_)) => {}
            _ => return Err(MapError::PartialDistance),
        }
        for (column, values) in [("distmu", &distmu), ("distsigma", &distsigma), ("distnorm", &distnorm)]
        {
            if let Some(values) = values {
                if values.len() != uniq.len() {
                    return Err(MapError::ColumnLength {
                        column,
                        got: values.len(),
                        expected: uniq.len(),
                    });
                }
            }
        }

        for (position, &u) in uniq.iter().enumerate() {
            if u < 4 {
                return Err(MapError::InvalidUniq { uniq: u, position });
            }
            let (order, ipix) = healpix::uniq_to_nest(u);
            if order > healpix::MAX_ORDER || ipix >= healpix::npix(order) {
                return Err(MapError::InvalidUniq { uniq: u, position });
            }
            if position > 0 && uniq[position - 1] >= u {
                return Err(MapError::UnsortedUniq { position });
            }
        }
        for (position, &d) in probdensity.iter().enumerate() {
            if !d.is_finite() || d < 0.0 {
                return Err(MapError::InvalidDensity { position });
            }
        }

        let map = Self {
            name: name.into(),
            dateobs,
            uniq,
            probdensity,
            distmu,
            distsigma,
            distnorm,
            contour: None,
        };
        let total = map.total_probability();
        if (total - 1.0).abs() > NORMALIZATION_TOLERANCE {
            return Err(MapError::NotNormalized {
                total,
                tolerance: NORMALIZATION_TOLERANCE,
            });
        }
        Ok(map)
    }

    pub fn tile_count(&self) -> usize {
        self.uniq.len()
    }

    /// True when the map carries the per-pixel distance-distribution layer.
    pub fn is_3d(&self) -> bool {
        self.distmu.is_some()
    }

    /// Probability integrated over the tile solid angles.
    pub fn total_probability(&self) -> f64 {
        self.uniq
            .iter()
            .zip(&self.probdensity)
            .map(|(&u, &d)| {
                let (order, _) = healpix::uniq_to_nest(u);
                d * healpix::pixel_area(order)
            })
            .sum()
    }

    /// Rasterize to a uniform nested grid at `order`, returning probability
    /// per pixel. Coarse tiles spread their density across descendants;
    /// tiles finer than `order` fold their mass into the covering ancestor.
    /// Total probability is conserved exactly up to float summation.
    pub fn flatten(&self, order: u8) -> Vec<f64> {
        let mut flat = vec![0.0; healpix::npix(order) as usize];
        let cell_area = healpix::pixel_area(order);
        for (&u, &density) in self.uniq.iter().zip(&self.probdensity) {
            let (tile_order, ipix) = healpix::uniq_to_nest(u);
            if tile_order <= order {
                for child in healpix::child_range(tile_order, ipix, order) {
                    flat[child as usize] += density * cell_area;
                }
            } else {
                let ancestor = ipix >> (2 * (tile_order - order));
                flat[ancestor as usize] += density * healpix::pixel_area(tile_order);
            }
        }
        flat
    }

    /// Solid angle, in square degrees, of the smallest pixel set whose
    /// cumulative probability reaches `percentile` at the working
    /// resolution.
    pub fn percentile_area_deg2(&self, percentile: f64) -> f64 {
        let mut probs = self.flatten(WORKING_ORDER);
        probs.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let mut cumulative = 0.0;
        let mut count = 0usize;
        for p in probs {
            if cumulative >= percentile {
                break;
            }
            cumulative += p;
            count += 1;
        }
        let sr = count as f64 * healpix::pixel_area(WORKING_ORDER);
        sr * (180.0 / std::f64::consts::PI).powi(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DateObs {
        "2019-04-25T08:18:05".parse().unwrap()
    }

    // Single order-1 tile holding all the mass.
    fn single_tile() -> MapPayload {
        let uniq = healpix::nest_to_uniq(1, 5);
        MapPayload {
            uniq: vec![uniq],
            probdensity: vec![1.0 / healpix::pixel_area(1)],
            distmu: None,
            distsigma: None,
            distnorm: None,
        }
    }

    #[test]
    fn accepts_normalized_map() {
        let map = HealpixMap::from_payload("bayestar.json", key(), single_tile()).unwrap();
        assert_eq!(map.tile_count(), 1);
        assert!((map.total_probability() - 1.0).abs() < 1e-12);
        assert!(!map.is_3d());
    }

    #[test]
    fn rejects_empty_and_mismatched_columns() {
        let empty = MapPayload {
            uniq: vec![],
            probdensity: vec![],
            distmu: None,
            distsigma: None,
            distnorm: None,
        };
        assert!(matches!(
            HealpixMap::from_payload("m", key(), empty),
            Err(MapError::Empty)
        ));

        let mut p = single_tile();
        p.probdensity.push(0.0);
        assert!(matches!(
            HealpixMap::from_payload("m", key(), p),
            Err(MapError::ColumnLength { .. })
        ));
    }

    #[test]
    fn rejects_unsorted_and_duplicate_uniq() {
        let d = 0.5 / healpix::pixel_area(1);
        let a = healpix::nest_to_uniq(1, 5);
        let b = healpix::nest_to_uniq(1, 3);
        let p = MapPayload {
            uniq: vec![a, b],
            probdensity: vec![d, d],
            distmu: None,
            distsigma: None,
            distnorm: None,
        };
        assert!(matches!(
            HealpixMap::from_payload("m", key(), p),
            Err(MapError::UnsortedUniq { position: 1 })
        ));

        let p = MapPayload {
            uniq: vec![a, a],
            probdensity: vec![d, d],
            distmu: None,
            distsigma: None,
            distnorm: None,
        };
        assert!(matches!(
            HealpixMap::from_payload("m", key(), p),
            Err(MapError::UnsortedUniq { position: 1 })
        ));
    }

    #[test]
    fn rejects_partial_distance_layer() {
        let mut p = single_tile();
        p.distmu = Some(vec![100.0]);
        assert!(matches!(
            HealpixMap::from_payload("m", key(), p),
            Err(MapError::PartialDistance)
        ));
    }

    #[test]
    fn rejects_unnormalized_map() {
        let mut p = single_tile();
        p.probdensity[0] *= 1.5;
        match HealpixMap::from_payload("m", key(), p) {
            Err(MapError::NotNormalized { total, .. }) => {
                assert!((total - 1.5).abs() < 1e-9)
            }
            other => panic!("expected NotNormalized, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_uniq_values() {
        let p = MapPayload {
            uniq: vec![2],
            probdensity: vec![1.0],
            distmu: None,
            distsigma: None,
            distnorm: None,
        };
        assert!(matches!(
            HealpixMap::from_payload("m", key(), p),
            Err(MapError::InvalidUniq { .. })
        ));
    }

    #[test]
    fn flatten_conserves_mass_downward() {
        let map = HealpixMap::from_payload("m", key(), single_tile()).unwrap();
        let flat = map.flatten(3);
        let total: f64 = flat.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        // The order-1 tile covers 16 order-3 pixels, all equal.
        let nonzero: Vec<f64> = flat.iter().copied().filter(|&p| p > 0.0).collect();
        assert_eq!(nonzero.len(), 16);
        assert!(nonzero.iter().all(|&p| (p - 1.0 / 16.0).abs() < 1e-12));
    }

    #[test]
    fn flatten_folds_fine_tiles_upward() {
        // Half the mass on an order-3 tile, half on an order-1 tile; flatten
        // to order 1.
        let fine_ipix = healpix::child_range(1, 0, 3).start; // descendant of order-1 pixel 0
        let p = MapPayload {
            uniq: vec![
                healpix::nest_to_uniq(1, 7),
                healpix::nest_to_uniq(3, fine_ipix),
            ],
            probdensity: vec![
                0.5 / healpix::pixel_area(1),
                0.5 / healpix::pixel_area(3),
            ],
            distmu: None,
            distsigma: None,
            distnorm: None,
        };
        // Sorted check: uniq(1, 7) = 23, uniq(3, 0) = 256.
        let map = HealpixMap::from_payload("m", key(), p).unwrap();
        let flat = map.flatten(1);
        assert!((flat.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((flat[0] - 0.5).abs() < 1e-12);
        assert!((flat[7] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn percentile_area_tracks_concentration() {
        let map = HealpixMap::from_payload("m", key(), single_tile()).unwrap();
        // All mass sits uniformly in 1/48 of the sphere, so the 90% region
        // covers 90% of the tile footprint (within one working pixel).
        let full_sky = 4.0 * std::f64::consts::PI * (180.0 / std::f64::consts::PI).powi(2);
        let tile_area = full_sky / 48.0;
        let pixel = full_sky / healpix::npix(WORKING_ORDER) as f64;
        let area = map.percentile_area_deg2(0.9);
        assert!((area - 0.9 * tile_area).abs() <= pixel + 1e-9);
        assert!(map.percentile_area_deg2(0.5) < area);
    }
}
