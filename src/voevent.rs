//! VOEvent notice parsing.
//!
//! Alert brokers deliver VOEvent XML documents. This module extracts the
//! fields the pipeline consumes into a [`ParsedNotice`] in one pass:
//! identity (ivorn, packet type, stream), timestamps, classification
//! parameters and whatever localization hints the notice carries (sky-map
//! URLs or an error cone). Tag derivation and acquisition-strategy selection
//! live in the correlator; this module only reads the document.
//!
//! Element matching ignores XML namespaces: upstream notices bind the
//! VOEvent schema to the root element only, and the nesting of prefixed vs
//! unprefixed children varies between producers.

use chrono::{DateTime, NaiveDateTime, Utc};
use roxmltree::{Document, Node};
use thiserror::Error;

use crate::api::DateObs;
use crate::models::{GcnNotice, NoticeType};

#[derive(Debug, Error)]
pub enum VoeventError {
    #[error("malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("notice has no ivorn attribute")]
    MissingIvorn,
    #[error("missing element or attribute: {0}")]
    Missing(&'static str),
    #[error("invalid timestamp '{value}': {source}")]
    BadTimestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("invalid number '{value}' for {what}")]
    BadNumber { what: &'static str, value: String },
}

/// A position cone: best-estimate coordinates plus an error radius, all in
/// degrees. The radius is whatever confidence level the mission reports;
/// conversion to 1-sigma happens during acquisition-strategy selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConePosition {
    pub ra: f64,
    pub dec: f64,
    pub error_radius: f64,
}

/// Everything the pipeline reads out of one VOEvent document.
#[derive(Debug, Clone)]
pub struct ParsedNotice {
    pub ivorn: String,
    pub notice_type: NoticeType,
    /// Issuing stream, from the ivorn path (e.g. `Fermi`, `AMON`, `LVC`).
    pub stream: String,
    /// Message timestamp from `Who/Date`.
    pub date: DateTime<Utc>,
    /// Event timestamp, rounded to whole seconds.
    pub dateobs: DateObs,
    /// `Why/Inference/Concept` text, when present.
    pub why_concept: Option<String>,
    /// `Long_short` parameter (Fermi GBM burst duration class).
    pub long_short: Option<String>,
    /// `Duration_class` parameter (Fermi GBM subthreshold convention).
    pub duration_class: Option<String>,
    /// (name, probability) entries of the `Classification` group.
    pub classification: Vec<(String, f64)>,
    /// `Search` parameter (IceCube track selections and similar).
    pub search: Option<String>,
    /// `skymap_fits` URL from a `GW_SKYMAP` group.
    pub skymap_url: Option<String>,
    /// `LocationMap_URL` parameter (Fermi GBM final positions).
    pub location_map_url: Option<String>,
    /// `HealPix_URL` parameter (Fermi GBM subthreshold notices).
    pub healpix_url: Option<String>,
    /// `Retraction` parameter value, when present.
    pub retraction: Option<i64>,
    /// Error cone from `Position2D`, when the notice carries one.
    pub position: Option<ConePosition>,
}

impl ParsedNotice {
    /// Build the storable notice row, pairing the parsed identity with the
    /// raw payload.
    pub fn to_notice(&self, payload: &str) -> GcnNotice {
        GcnNotice {
            ivorn: self.ivorn.clone(),
            notice_type: self.notice_type,
            stream: self.stream.clone(),
            date: self.date,
            dateobs: self.dateobs,
            content: payload.to_string(),
        }
    }
}

/// Parse a VOEvent payload into a [`ParsedNotice`].
pub fn parse(payload: &str) -> Result<ParsedNotice, VoeventError> {
    let doc = Document::parse(payload)?;
    let root = doc.root_element();

    let ivorn = root
        .attribute("ivorn")
        .ok_or(VoeventError::MissingIvorn)?
        .to_string();
    let stream = stream_from_ivorn(&ivorn);

    let packet = param_value(root, "Packet_Type").ok_or(VoeventError::Missing(
        "What/Param[@name='Packet_Type']",
    ))?;
    let code: i64 = packet
        .parse()
        .map_err(|_| VoeventError::BadNumber {
            what: "Packet_Type",
            value: packet.to_string(),
        })?;
    let notice_type = NoticeType::from(code);

    let date_text = descendant(root, "Who")
        .and_then(|who| child(who, "Date"))
        .and_then(|d| d.text())
        .ok_or(VoeventError::Missing("Who/Date"))?;
    let date = parse_timestamp(date_text)?;

    let iso_text = utc_astro_coords(root)
        .and_then(|coords| descendant(coords, "ISOTime"))
        .and_then(|t| t.text())
        .ok_or(VoeventError::Missing(
            "AstroCoords[@coord_system_id='UTC-FK5-GEO']//ISOTime",
        ))?;
    let dateobs = DateObs::new(parse_timestamp(iso_text)?);

    let why_concept = descendant(root, "Why")
        .and_then(|why| descendant(why, "Concept"))
        .and_then(|c| c.text())
        .map(|s| s.trim().to_string());

    let what = child(root, "What");
    let classification = what
        .and_then(|what| group(what, "Classification"))
        .map(|g| {
            g.children()
                .filter(|n| n.is_element() && n.tag_name().name() == "Param")
                .filter_map(|p| {
                    let name = p.attribute("name")?.to_string();
                    let value: f64 = p.attribute("value")?.parse().ok()?;
                    Some((name, value))
                })
                .collect()
        })
        .unwrap_or_default();

    let skymap_url = what
        .and_then(|what| group(what, "GW_SKYMAP"))
        .and_then(|g| param_value(g, "skymap_fits"))
        .map(str::to_string);

    let retraction = param_value(root, "Retraction").and_then(|v| v.parse().ok());

    Ok(ParsedNotice {
        ivorn,
        notice_type,
        stream,
        date,
        dateobs,
        why_concept,
        long_short: param_value(root, "Long_short").map(str::to_string),
        duration_class: param_value(root, "Duration_class").map(str::to_string),
        classification,
        search: param_value(root, "Search").map(str::to_string),
        skymap_url,
        location_map_url: param_value(root, "LocationMap_URL").map(str::to_string),
        healpix_url: param_value(root, "HealPix_URL").map(str::to_string),
        retraction,
        position: parse_position(root)?,
    })
}

/// Stream name from an ivorn: the path component, without the leading
/// slash or the fragment. `ivo://nasa.gsfc.gcn/Fermi#GBM_Fin_Pos...` →
/// `Fermi`.
fn stream_from_ivorn(ivorn: &str) -> String {
    let rest = ivorn.strip_prefix("ivo://").unwrap_or(ivorn);
    let rest = rest.split('#').next().unwrap_or(rest);
    match rest.find('/') {
        Some(at) => rest[at + 1..].trim_start_matches('/').to_string(),
        None => String::new(),
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, VoeventError> {
    let trimmed = text.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|source| VoeventError::BadTimestamp {
            value: text.to_string(),
            source,
        })
}

fn parse_position(root: Node) -> Result<Option<ConePosition>, VoeventError> {
    let location = match descendant(root, "ObservationLocation") {
        Some(node) => node,
        None => return Ok(None),
    };
    let position = match descendant(location, "Position2D") {
        Some(node) => node,
        None => return Ok(None),
    };
    let value2 = match child(position, "Value2") {
        Some(node) => node,
        None => return Ok(None),
    };
    let (c1, c2, radius) = match (
        child(value2, "C1").and_then(|n| n.text()),
        child(value2, "C2").and_then(|n| n.text()),
        child(position, "Error2Radius").and_then(|n| n.text()),
    ) {
        (Some(c1), Some(c2), Some(r)) => (c1, c2, r),
        _ => return Ok(None),
    };

    let parse_f64 = |what: &'static str, text: &str| -> Result<f64, VoeventError> {
        text.trim().parse().map_err(|_| VoeventError::BadNumber {
            what,
            value: text.to_string(),
        })
    };
    Ok(Some(ConePosition {
        ra: parse_f64("Position2D/Value2/C1", c1)?,
        dec: parse_f64("Position2D/Value2/C2", c2)?,
        error_radius: parse_f64("Position2D/Error2Radius", radius)?,
    }))
}

/// The AstroCoords element carrying the UTC event time.
fn utc_astro_coords<'a>(root: Node<'a, 'a>) -> Option<Node<'a, 'a>> {
    root.descendants().find(|n| {
        n.is_element()
            && n.tag_name().name() == "AstroCoords"
            && n.attribute("coord_system_id") == Some("UTC-FK5-GEO")
    })
}

fn child<'a>(node: Node<'a, 'a>, name: &str) -> Option<Node<'a, 'a>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn descendant<'a>(node: Node<'a, 'a>, name: &str) -> Option<Node<'a, 'a>> {
    node.descendants()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn group<'a>(what: Node<'a, 'a>, group_type: &str) -> Option<Node<'a, 'a>> {
    what.children().find(|c| {
        c.is_element()
            && c.tag_name().name() == "Group"
            && c.attribute("type") == Some(group_type)
    })
}

fn param_value<'a>(scope: Node<'a, 'a>, name: &str) -> Option<&'a str> {
    scope
        .descendants()
        .find(|n| {
            n.is_element()
                && n.tag_name().name() == "Param"
                && n.attribute("name") == Some(name)
        })
        .and_then(|n| n.attribute("value"))
}
