//! Public API surface for the follow-up pipeline.
//!
//! This file consolidates the value types shared by the library, the
//! repository layer and the HTTP API: event keys, filter codes, contour
//! features and the plan-export wire format.
//! All types derive Serialize/Deserialize for JSON serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use crate::models::ModifiedJulianDate;

/// Event key: the event timestamp in UTC, truncated to whole seconds after
/// rounding. Two notices whose timestamps round to the same second belong
/// to the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateObs(DateTime<Utc>);

impl DateObs {
    /// Round an arbitrary timestamp to the nearest whole second.
    pub fn new(dt: DateTime<Utc>) -> Self {
        let carry = i64::from(dt.timestamp_subsec_nanos() >= 500_000_000);
        let rounded = DateTime::from_timestamp(dt.timestamp() + carry, 0)
            .unwrap_or_else(|| DateTime::UNIX_EPOCH);
        DateObs(rounded)
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn to_mjd(&self) -> ModifiedJulianDate {
        ModifiedJulianDate::from_datetime(self.0)
    }
}

impl fmt::Display for DateObs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S"))
    }
}

impl FromStr for DateObs {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let naive = chrono::NaiveDateTime::parse_from_str(
            s.trim_end_matches('Z'),
            "%Y-%m-%dT%H:%M:%S",
        )?;
        Ok(DateObs(naive.and_utc()))
    }
}

impl Serialize for DateObs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DateObs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Field identifier, unique within one telescope's tessellation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub i64);

impl FieldId {
    pub fn new(value: i64) -> Self {
        FieldId(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<FieldId> for i64 {
    fn from(id: FieldId) -> Self {
        id.0
    }
}

/// Photometric filter. The numeric codes consumed by scheduler backends
/// cover the griz+J set; filters outside that table cannot appear in an
/// exported plan.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    #[serde(rename = "g")]
    G,
    #[serde(rename = "r")]
    R,
    #[serde(rename = "i")]
    I,
    #[serde(rename = "z")]
    Z,
    #[serde(rename = "J")]
    J,
    #[serde(rename = "U")]
    U,
}

impl Filter {
    /// Backend filter code, when the filter has one.
    pub fn code(&self) -> Option<i64> {
        match self {
            Filter::G => Some(1),
            Filter::R => Some(2),
            Filter::I => Some(3),
            Filter::Z => Some(4),
            Filter::J => Some(5),
            Filter::U => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Filter::G => "g",
            Filter::R => "r",
            Filter::I => "i",
            Filter::Z => "z",
            Filter::J => "J",
            Filter::U => "U",
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Filter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "g" => Ok(Filter::G),
            "r" => Ok(Filter::R),
            "i" => Ok(Filter::I),
            "z" => Ok(Filter::Z),
            "J" => Ok(Filter::J),
            "U" => Ok(Filter::U),
            other => Err(format!("unknown filter '{other}'")),
        }
    }
}

/// Geometry of a contour feature: a single sky position or a set of closed
/// polylines, coordinates as [ra, dec] in degrees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: [f64; 2] },
    MultiLineString { coordinates: Vec<Vec<[f64; 2]>> },
}

/// Per-feature metadata: the credible level the feature describes
/// (0 for the posterior-maximum point).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeatureProperties {
    pub credible_level: f64,
}

/// One contour feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    pub properties: FeatureProperties,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum FeatureKind {
    Feature,
}

/// Credible-region contour set for one probability map: the posterior
/// maximum plus one polyline feature per requested level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: FeatureCollectionKind,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum FeatureCollectionKind {
    FeatureCollection,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: FeatureCollectionKind::FeatureCollection,
            features,
        }
    }
}

/// One queue target in the plan-export wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueTarget {
    pub request_id: i64,
    pub program_id: i64,
    pub field_id: i64,
    pub ra: qtty::Degrees,
    pub dec: qtty::Degrees,
    pub filter_id: i64,
    /// Exposure time in seconds (already divided by the dither norm for
    /// backends that expand dithers downstream).
    pub exposure_time: f64,
    pub program_pi: String,
    pub subprogram_name: String,
}

/// Exported plan as consumed by queue-style scheduler backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanExport {
    pub queue_name: String,
    /// [start, end] in MJD.
    pub validity_window_mjd: [f64; 2],
    pub targets: Vec<QueueTarget>,
}

/// One row of the flat per-exposure format used by file-drop backends
/// (one record per physical exposure, dithers already expanded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlatExposure {
    pub queue_name: String,
    pub seqnum: usize,
    pub seqtot: usize,
    pub field_id: i64,
    pub ra: qtty::Degrees,
    pub dec: qtty::Degrees,
    pub filter: Filter,
    pub exposure_time: f64,
    pub subprogram_name: String,
}

/// Aggregate plan statistics served once a plan is READY.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSummary {
    pub num_observations: usize,
    /// Total exposure + overhead time in seconds.
    pub total_time: f64,
    /// Sky area covered by the plan's distinct fields, in square degrees.
    pub area: f64,
    /// Probability enclosed by the plan's distinct fields.
    pub probability: f64,
    pub status: crate::models::PlanStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dateobs_rounds_to_nearest_second() {
        let dt = DateTime::parse_from_rfc3339("2018-01-16T00:36:52.810Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(DateObs::new(dt).to_string(), "2018-01-16T00:36:53");

        let dt = DateTime::parse_from_rfc3339("2018-01-16T00:36:52.300Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(DateObs::new(dt).to_string(), "2018-01-16T00:36:52");
    }

    #[test]
    fn dateobs_string_round_trip() {
        let key: DateObs = "2019-04-25T08:18:05".parse().unwrap();
        assert_eq!(key.to_string(), "2019-04-25T08:18:05");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2019-04-25T08:18:05\"");
        let back: DateObs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn dateobs_accepts_zulu_suffix() {
        let key: DateObs = "2019-04-25T08:18:05Z".parse().unwrap();
        assert_eq!(key.to_string(), "2019-04-25T08:18:05");
    }

    #[test]
    fn filter_codes_match_backend_table() {
        assert_eq!(Filter::G.code(), Some(1));
        assert_eq!(Filter::R.code(), Some(2));
        assert_eq!(Filter::I.code(), Some(3));
        assert_eq!(Filter::Z.code(), Some(4));
        assert_eq!(Filter::J.code(), Some(5));
        assert_eq!(Filter::U.code(), None);
    }

    #[test]
    fn filter_parse_display_round_trip() {
        for s in ["g", "r", "i", "z", "J", "U"] {
            let f: Filter = s.parse().unwrap();
            assert_eq!(f.to_string(), s);
        }
        assert!("y".parse::<Filter>().is_err());
    }

    #[test]
    fn feature_collection_serializes_geojson_style() {
        let fc = FeatureCollection::new(vec![Feature {
            kind: FeatureKind::Feature,
            properties: FeatureProperties { credible_level: 0.9 },
            geometry: Geometry::MultiLineString {
                coordinates: vec![vec![[10.0, 5.0], [11.0, 5.0], [10.0, 5.0]]],
            },
        }]);
        let json = serde_json::to_value(&fc).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        assert_eq!(json["features"][0]["type"], "Feature");
        assert_eq!(json["features"][0]["geometry"]["type"], "MultiLineString");
        assert_eq!(json["features"][0]["properties"]["credible_level"], 0.9);
    }
}
