//! Events, notices and classification tags.
//!
//! An [`Event`] is keyed by its timestamp rounded to whole seconds; every
//! notice whose embedded event time rounds to the same second merges into
//! the same row. Notices are append-only children carrying the raw payload;
//! tags are an unordered set with a fixed precedence used only for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::api::DateObs;

/// Notice types this pipeline recognizes, by upstream packet code. Codes
/// outside the subscribed set are preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", from = "i64")]
pub enum NoticeType {
    FermiGbmFltPos,
    FermiGbmGndPos,
    FermiGbmFinPos,
    FermiGbmSubthresh,
    LvcPreliminary,
    LvcInitial,
    LvcUpdate,
    LvcRetraction,
    AmonIcecubeCoinc,
    AmonIcecubeHese,
    IcecubeAstrotrackGold,
    IcecubeAstrotrackBronze,
    Other(i64),
}

impl NoticeType {
    pub fn code(&self) -> i64 {
        match self {
            NoticeType::FermiGbmFltPos => 111,
            NoticeType::FermiGbmGndPos => 112,
            NoticeType::FermiGbmFinPos => 115,
            NoticeType::FermiGbmSubthresh => 131,
            NoticeType::LvcPreliminary => 150,
            NoticeType::LvcInitial => 151,
            NoticeType::LvcUpdate => 152,
            NoticeType::LvcRetraction => 164,
            NoticeType::AmonIcecubeCoinc => 157,
            NoticeType::AmonIcecubeHese => 158,
            NoticeType::IcecubeAstrotrackGold => 173,
            NoticeType::IcecubeAstrotrackBronze => 174,
            NoticeType::Other(code) => *code,
        }
    }

    /// True for the gravitational-wave notice family.
    pub fn is_lvc(&self) -> bool {
        matches!(
            self,
            NoticeType::LvcPreliminary
                | NoticeType::LvcInitial
                | NoticeType::LvcUpdate
                | NoticeType::LvcRetraction
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NoticeType::FermiGbmFltPos => "FERMI_GBM_FLT_POS",
            NoticeType::FermiGbmGndPos => "FERMI_GBM_GND_POS",
            NoticeType::FermiGbmFinPos => "FERMI_GBM_FIN_POS",
            NoticeType::FermiGbmSubthresh => "FERMI_GBM_SUBTHRESH",
            NoticeType::LvcPreliminary => "LVC_PRELIMINARY",
            NoticeType::LvcInitial => "LVC_INITIAL",
            NoticeType::LvcUpdate => "LVC_UPDATE",
            NoticeType::LvcRetraction => "LVC_RETRACTION",
            NoticeType::AmonIcecubeCoinc => "AMON_ICECUBE_COINC",
            NoticeType::AmonIcecubeHese => "AMON_ICECUBE_HESE",
            NoticeType::IcecubeAstrotrackGold => "ICECUBE_ASTROTRACK_GOLD",
            NoticeType::IcecubeAstrotrackBronze => "ICECUBE_ASTROTRACK_BRONZE",
            NoticeType::Other(_) => "UNKNOWN",
        }
    }
}

impl From<i64> for NoticeType {
    fn from(code: i64) -> Self {
        match code {
            111 => NoticeType::FermiGbmFltPos,
            112 => NoticeType::FermiGbmGndPos,
            115 => NoticeType::FermiGbmFinPos,
            131 => NoticeType::FermiGbmSubthresh,
            150 => NoticeType::LvcPreliminary,
            151 => NoticeType::LvcInitial,
            152 => NoticeType::LvcUpdate,
            164 => NoticeType::LvcRetraction,
            157 => NoticeType::AmonIcecubeCoinc,
            158 => NoticeType::AmonIcecubeHese,
            173 => NoticeType::IcecubeAstrotrackGold,
            174 => NoticeType::IcecubeAstrotrackBronze,
            other => NoticeType::Other(other),
        }
    }
}

impl From<NoticeType> for i64 {
    fn from(t: NoticeType) -> Self {
        t.code()
    }
}

impl fmt::Display for NoticeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoticeType::Other(code) => write!(f, "UNKNOWN({code})"),
            known => f.write_str(known.name()),
        }
    }
}

/// One received alert notice: immutable raw payload plus parsed metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GcnNotice {
    /// Globally unique alert identifier.
    pub ivorn: String,
    pub notice_type: NoticeType,
    /// Issuing stream/mission, from the ivorn path.
    pub stream: String,
    /// Message timestamp (when the notice was sent).
    pub date: DateTime<Utc>,
    /// Event timestamp this notice refers to.
    pub dateobs: DateObs,
    /// Raw notice document.
    pub content: String,
}

impl GcnNotice {
    /// Hex SHA-256 of the raw payload, used to recognize re-deliveries that
    /// reuse an ivorn with altered content.
    pub fn payload_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// Display precedence for tags: missions, then duration classes, then event
// classes, then everything else. Comparison is on lowercased text.
const MISSION_TAGS: [&str; 4] = ["fermi", "swift", "amon", "lvc"];
const DURATION_TAGS: [&str; 2] = ["long", "short"];
const CLASS_TAGS: [&str; 3] = ["grb", "gw", "transient"];

fn tag_rank(tag: &str) -> (bool, bool, bool) {
    let lower = tag.to_lowercase();
    (
        !MISSION_TAGS.contains(&lower.as_str()),
        !DURATION_TAGS.contains(&lower.as_str()),
        !CLASS_TAGS.contains(&lower.as_str()),
    )
}

/// One astrophysical event, aggregating every notice that resolved to the
/// same rounded timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub dateobs: DateObs,
    /// Notices in message-date order.
    pub gcn_notices: Vec<GcnNotice>,
    /// Classification tags; set semantics.
    pub tags: BTreeSet<String>,
}

impl Event {
    pub fn new(dateobs: DateObs) -> Self {
        Self {
            dateobs,
            gcn_notices: Vec::new(),
            tags: BTreeSet::new(),
        }
    }

    /// Append a notice unless one with the same ivorn was already recorded.
    /// Returns whether the notice was added. Notices stay sorted by message
    /// date.
    pub fn add_notice(&mut self, notice: GcnNotice) -> bool {
        if self.gcn_notices.iter().any(|n| n.ivorn == notice.ivorn) {
            return false;
        }
        let at = self
            .gcn_notices
            .partition_point(|n| n.date <= notice.date);
        self.gcn_notices.insert(at, notice);
        true
    }

    /// Merge tags into the set; duplicates are no-ops. Returns whether the
    /// set changed.
    pub fn merge_tags<I: IntoIterator<Item = String>>(&mut self, tags: I) -> bool {
        let before = self.tags.len();
        self.tags.extend(tags);
        self.tags.len() != before
    }

    pub fn retracted(&self) -> bool {
        self.tags.contains("retracted")
    }

    /// Tags in display order: missions first, then short/long, then the
    /// event-class tags, remainder alphabetical. Storage order carries no
    /// meaning.
    pub fn display_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tags.iter().cloned().collect();
        tags.sort_by(|a, b| tag_rank(a).cmp(&tag_rank(b)).then_with(|| a.cmp(b)));
        tags
    }
}
