//! Credible-region contours.
//!
//! A map's credible level at a pixel is the cumulative probability of every
//! pixel at least as probable, so thresholding levels at p selects the
//! smallest pixel set holding probability p. Contours are the boundaries of
//! those sets, traced on a fixed lon/lat marching grid and simplified to
//! their corner points. The result is cached on the map row; recomputing is
//! idempotent.

use std::collections::HashMap;

use tracing::debug;

use crate::api::{
    DateObs, Feature, FeatureCollection, FeatureKind, FeatureProperties, Geometry,
};
use crate::db::{LocalizationRepository, RepositoryError};
use crate::healpix;
use crate::models::WORKING_ORDER;

/// Credible levels a contour set carries, beyond the posterior-maximum
/// point.
pub const CONTOUR_LEVELS: [f64; 2] = [0.5, 0.9];

/// Marching-grid node spacing in degrees.
const GRID_STEP: f64 = 0.5;

/// Per-pixel credible levels for a flattened probability array: the most
/// probable pixel gets its own probability, and each further pixel in
/// descending-probability order gets the running cumulative sum.
pub fn credible_levels(flat: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..flat.len()).collect();
    order.sort_by(|&a, &b| {
        flat[b]
            .partial_cmp(&flat[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut levels = vec![0.0; flat.len()];
    let mut cumulative = 0.0;
    for &idx in &order {
        cumulative += flat[idx];
        levels[idx] = cumulative;
    }
    levels
}

/// Fetch the cached contour for a map, computing and attaching it first if
/// absent.
pub async fn compute_contour<R>(
    repo: &R,
    dateobs: DateObs,
    map_name: &str,
) -> Result<FeatureCollection, RepositoryError>
where
    R: LocalizationRepository + ?Sized,
{
    let map = repo.get_localization(dateobs, map_name).await?;
    if let Some(cached) = map.contour {
        debug!(%dateobs, map_name, "contour already computed");
        return Ok(cached);
    }
    let flat = map.flatten(WORKING_ORDER);
    let collection = contour_features(&flat, &CONTOUR_LEVELS);
    repo.attach_contour(dateobs, map_name, collection.clone())
        .await?;
    Ok(collection)
}

/// Build the feature collection for a flattened map: a point at the
/// posterior maximum (credible level 0) and one multi-polyline feature per
/// requested level.
pub fn contour_features(flat: &[f64], levels: &[f64]) -> FeatureCollection {
    let cls = credible_levels(flat);

    let peak = flat
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let (ra, dec) = healpix::pix_to_ang(WORKING_ORDER, peak as u64);

    let mut features = Vec::with_capacity(levels.len() + 1);
    features.push(Feature {
        kind: FeatureKind::Feature,
        properties: FeatureProperties { credible_level: 0.0 },
        geometry: Geometry::Point {
            coordinates: [ra, dec],
        },
    });

    let nodes = node_pixels();
    for &level in levels {
        features.push(Feature {
            kind: FeatureKind::Feature,
            properties: FeatureProperties {
                credible_level: level,
            },
            geometry: Geometry::MultiLineString {
                coordinates: trace_level(&cls, level, &nodes),
            },
        });
    }
    FeatureCollection::new(features)
}

const GRID_COLS: usize = (360.0 / GRID_STEP) as usize;
const GRID_ROWS: usize = (180.0 / GRID_STEP) as usize;

/// Working-order pixel index under every marching-grid node. Sampled once
/// per contour set and shared across levels.
fn node_pixels() -> Vec<u32> {
    let mut nodes = Vec::with_capacity((GRID_COLS + 1) * (GRID_ROWS + 1));
    for j in 0..=GRID_ROWS {
        let dec = -90.0 + j as f64 * GRID_STEP;
        for i in 0..=GRID_COLS {
            let ra = i as f64 * GRID_STEP;
            nodes.push(healpix::ang_to_pix(WORKING_ORDER, ra, dec) as u32);
        }
    }
    nodes
}

/// Marching squares over the node grid for one credible level. Cell corners
/// are classified inside when their pixel's level is at or below the
/// threshold; boundary vertices sit on cell-edge midpoints.
fn trace_level(cls: &[f64], level: f64, nodes: &[u32]) -> Vec<Vec<[f64; 2]>> {
    let inside =
        |i: usize, j: usize| cls[nodes[j * (GRID_COLS + 1) + i] as usize] <= level;

    let mut segments: Vec<([f64; 2], [f64; 2])> = Vec::new();
    for j in 0..GRID_ROWS {
        let dec = -90.0 + j as f64 * GRID_STEP;
        for i in 0..GRID_COLS {
            let ra = i as f64 * GRID_STEP;
            let case = inside(i, j) as u8
                | (inside(i + 1, j) as u8) << 1
                | (inside(i + 1, j + 1) as u8) << 2
                | (inside(i, j + 1) as u8) << 3;
            if case == 0 || case == 15 {
                continue;
            }
            let bottom = [ra + GRID_STEP / 2.0, dec];
            let right = [ra + GRID_STEP, dec + GRID_STEP / 2.0];
            let top = [ra + GRID_STEP / 2.0, dec + GRID_STEP];
            let left = [ra, dec + GRID_STEP / 2.0];
            match case {
                1 | 14 => segments.push((left, bottom)),
                2 | 13 => segments.push((bottom, right)),
                3 | 12 => segments.push((left, right)),
                4 | 11 => segments.push((right, top)),
                6 | 9 => segments.push((bottom, top)),
                7 | 8 => segments.push((left, top)),
                // Saddles: treat the two inside corners as separate lobes.
                5 => {
                    segments.push((left, bottom));
                    segments.push((right, top));
                }
                _ => {
                    segments.push((bottom, right));
                    segments.push((top, left));
                }
            }
        }
    }
    chain_segments(segments)
}

/// Quantized endpoint key; grid vertices are multiples of a quarter degree,
/// exactly representable at this scale.
fn endpoint_key(p: [f64; 2]) -> (i64, i64) {
    ((p[0] * 1000.0).round() as i64, (p[1] * 1000.0).round() as i64)
}

/// Join loose segments into polylines by matching endpoints, closing loops
/// where they meet themselves, and dropping collinear interior vertices.
fn chain_segments(segments: Vec<([f64; 2], [f64; 2])>) -> Vec<Vec<[f64; 2]>> {
    let mut by_end: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (idx, (a, b)) in segments.iter().enumerate() {
        by_end.entry(endpoint_key(*a)).or_default().push(idx);
        by_end.entry(endpoint_key(*b)).or_default().push(idx);
    }

    let take_unused = |by_end: &HashMap<(i64, i64), Vec<usize>>,
                       used: &[bool],
                       at: (i64, i64)| {
        by_end
            .get(&at)
            .and_then(|ids| ids.iter().copied().find(|&i| !used[i]))
    };

    let mut used = vec![false; segments.len()];
    let mut lines = Vec::new();
    for start in 0..segments.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let (a, b) = segments[start];
        let mut line = vec![a, b];

        // Grow from the tail until the line closes or dead-ends.
        loop {
            let tail = endpoint_key(*line.last().unwrap());
            if tail == endpoint_key(line[0]) {
                break;
            }
            let next = match take_unused(&by_end, &used, tail) {
                Some(i) => i,
                None => break,
            };
            used[next] = true;
            let (na, nb) = segments[next];
            line.push(if endpoint_key(na) == tail { nb } else { na });
        }
        // An open chain may continue from the head (seam-split contours).
        if endpoint_key(*line.last().unwrap()) != endpoint_key(line[0]) {
            loop {
                let head = endpoint_key(line[0]);
                let next = match take_unused(&by_end, &used, head) {
                    Some(i) => i,
                    None => break,
                };
                used[next] = true;
                let (na, nb) = segments[next];
                line.insert(0, if endpoint_key(na) == head { nb } else { na });
            }
        }
        lines.push(simplify(line));
    }
    lines
}

fn simplify(line: Vec<[f64; 2]>) -> Vec<[f64; 2]> {
    if line.len() < 3 {
        return line;
    }
    let closed = endpoint_key(line[0]) == endpoint_key(*line.last().unwrap());
    let mut out: Vec<[f64; 2]> = vec![line[0]];
    for idx in 1..line.len() - 1 {
        let prev = *out.last().unwrap();
        let cur = line[idx];
        let next = line[idx + 1];
        let cross = (cur[0] - prev[0]) * (next[1] - cur[1])
            - (cur[1] - prev[1]) * (next[0] - cur[0]);
        if cross.abs() > 1e-9 {
            out.push(cur);
        }
    }
    out.push(*line.last().unwrap());
    if closed {
        // Exact closure after quantized matching.
        let first = out[0];
        *out.last_mut().unwrap() = first;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalRepository;
    use crate::db::{EventRepository, LocalizationRepository};
    use crate::services::acquisition::synthesize_cone;

    fn key() -> DateObs {
        "2018-01-16T00:36:53".parse().unwrap()
    }

    #[test]
    fn credible_levels_follow_greedy_rank() {
        let flat = vec![0.1, 0.4, 0.2, 0.3];
        let cls = credible_levels(&flat);
        assert!((cls[1] - 0.4).abs() < 1e-12);
        assert!((cls[3] - 0.7).abs() < 1e-12);
        assert!((cls[2] - 0.9).abs() < 1e-12);
        assert!((cls[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fifty_percent_region_nests_inside_ninety() {
        let map = synthesize_cone(30.0, 10.0, 5.0, key()).unwrap();
        let cls = credible_levels(&map.flatten(WORKING_ORDER));
        let n50 = cls.iter().filter(|&&c| c <= 0.5).count();
        let n90 = cls.iter().filter(|&&c| c <= 0.9).count();
        assert!(n50 > 0);
        assert!(n50 < n90);
    }

    #[test]
    fn features_peak_at_center_and_close() {
        let map = synthesize_cone(30.0, 10.0, 5.0, key()).unwrap();
        let fc = contour_features(&map.flatten(WORKING_ORDER), &CONTOUR_LEVELS);
        assert_eq!(fc.features.len(), 3);

        match &fc.features[0].geometry {
            Geometry::Point { coordinates } => {
                let sep =
                    healpix::angular_separation(30.0, 10.0, coordinates[0], coordinates[1]);
                assert!(sep < 5.0, "posterior maximum {sep} degrees off center");
            }
            other => panic!("expected point, got {other:?}"),
        }

        for feature in &fc.features[1..] {
            let level = feature.properties.credible_level;
            match &feature.geometry {
                Geometry::MultiLineString { coordinates } => {
                    assert!(!coordinates.is_empty(), "no contour at level {level}");
                    for line in coordinates {
                        assert!(line.len() >= 4);
                        assert_eq!(line.first(), line.last(), "open ring at level {level}");
                        for point in line {
                            let sep = healpix::angular_separation(
                                30.0, 10.0, point[0], point[1],
                            );
                            assert!(sep < 20.0, "contour point {sep} degrees out");
                        }
                    }
                }
                other => panic!("expected polylines, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn compute_attaches_and_reuses_the_cache() {
        let repo = LocalRepository::new();
        repo.upsert_event(key()).await.unwrap();
        let map = synthesize_cone(30.0, 10.0, 5.0, key()).unwrap();
        let name = map.name.clone();
        repo.insert_localization(map).await.unwrap();

        let first = compute_contour(&repo, key(), &name).await.unwrap();
        let stored = repo.get_localization(key(), &name).await.unwrap();
        assert_eq!(stored.contour.as_ref(), Some(&first));

        let second = compute_contour(&repo, key(), &name).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn contour_for_missing_map_is_not_found() {
        let repo = LocalRepository::new();
        repo.upsert_event(key()).await.unwrap();
        let err = compute_contour(&repo, key(), "nope").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
    }
}
