//! Core domain model shared by every stage of the housing pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "housing-core";

/// The statically configured catalog of upstream datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Planning,
    Pts,
    Tco,
    MohcdPipeline,
    MohcdInclusionary,
    PermitAddendaSummary,
    #[serde(rename = "bmr")]
    AffordableRental,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Planning,
        SourceKind::Pts,
        SourceKind::Tco,
        SourceKind::MohcdPipeline,
        SourceKind::MohcdInclusionary,
        SourceKind::PermitAddendaSummary,
        SourceKind::AffordableRental,
    ];

    /// Name stored in the `source` column of the event log and used as the
    /// foreign key prefix.
    pub fn name(self) -> &'static str {
        match self {
            SourceKind::Planning => "planning",
            SourceKind::Pts => "pts",
            SourceKind::Tco => "tco",
            SourceKind::MohcdPipeline => "mohcd_pipeline",
            SourceKind::MohcdInclusionary => "mohcd_inclusionary",
            SourceKind::PermitAddendaSummary => "permit_addenda_summary",
            SourceKind::AffordableRental => "bmr",
        }
    }

    /// Name used in generated tables when attributing a value to a source.
    pub fn output_name(self) -> &'static str {
        match self {
            SourceKind::Pts => "dbi",
            other => other.name(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Root values of the authoritative source are never overridden by its children.
    pub fn is_authoritative(self) -> bool {
        matches!(self, SourceKind::Planning)
    }

    pub fn foreign_key(self, id: &str) -> String {
        format!("{}_{}", self.name(), id)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse an event log `last_updated` cell. Diff runs write plain ISO dates,
/// full dumps may carry a datetime with or without an offset.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.naive_utc())
}

/// Parse the leading whitespace-delimited token of `raw` using `format`.
/// A bare `%Y` format is accepted and maps to January 1st.
pub fn parse_date_token(raw: &str, format: &str) -> Option<NaiveDate> {
    let token = raw.split_whitespace().next()?;
    if format == "%Y" {
        let year: i32 = token.parse().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1);
    }
    NaiveDate::parse_from_str(token, format).ok()
}

/// Decoded source row: foreign key plus its allow-listed field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: SourceKind,
    pub fk: String,
    pub fields: BTreeMap<String, String>,
}

impl SourceRecord {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// One immutable row of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub fk: String,
    pub source: SourceKind,
    pub last_updated: NaiveDateTime,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub value: String,
    pub last_updated: NaiveDateTime,
}

/// Field history of one source record, each field sorted ascending by time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub fk: String,
    pub source: SourceKind,
    history: BTreeMap<String, Vec<NameValue>>,
}

impl Entry {
    pub fn new(fk: impl Into<String>, source: SourceKind) -> Self {
        Self {
            fk: fk.into(),
            source,
            history: BTreeMap::new(),
        }
    }

    pub fn with_values<I, K, V>(fk: impl Into<String>, source: SourceKind, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V, NaiveDateTime)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entry = Self::new(fk, source);
        for (name, value, last_updated) in values {
            entry.add_name_value(name, value, last_updated);
        }
        entry
    }

    /// Equal timestamps keep insertion order, so the most recently added of
    /// several same-time values is the latest.
    pub fn add_name_value(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        last_updated: NaiveDateTime,
    ) {
        let values = self.history.entry(name.into()).or_default();
        let at = values.partition_point(|nv| nv.last_updated <= last_updated);
        values.insert(
            at,
            NameValue {
                value: value.into(),
                last_updated,
            },
        );
    }

    pub fn add_fact(&mut self, fact: &Fact) {
        self.add_name_value(fact.name.clone(), fact.value.clone(), fact.last_updated);
    }

    pub fn latest(&self, name: &str) -> Option<&NameValue> {
        self.history.get(name).and_then(|values| values.last())
    }

    pub fn history(&self, name: &str) -> &[NameValue] {
        self.history.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn latest_name_values(&self) -> BTreeMap<&str, &str> {
        self.history
            .iter()
            .filter_map(|(name, values)| {
                values
                    .last()
                    .map(|nv| (name.as_str(), nv.value.as_str()))
            })
            .collect()
    }

    /// Earliest update time across every field, `None` for an empty entry.
    pub fn oldest_timestamp(&self) -> Option<NaiveDateTime> {
        self.history
            .values()
            .filter_map(|values| values.first())
            .map(|nv| nv.last_updated)
            .min()
    }

    pub fn num_name_values(&self) -> usize {
        self.history.values().map(Vec::len).sum()
    }
}
