//! Per-source data freshness: the most recent valid date seen for each
//! source while replaying the event log.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use housing_adapters::date_spec_for;
use housing_core::{Fact, SourceKind};
use tracing::warn;

const SAMPLE_LIMIT: usize = 10;

/// Value fields carrying dates; sources not listed here are judged by the
/// fact's `last_updated` instead.
fn date_fields(source: SourceKind) -> &'static [&'static str] {
    match source {
        SourceKind::Planning => &["date_opened", "date_closed"],
        SourceKind::Pts => &[
            "completed_date",
            "current_status_date",
            "filed_date",
            "first_construction_document_date",
            "issued_date",
            "permit_creation_date",
        ],
        SourceKind::Tco => &["date_issued"],
        _ => &[],
    }
}

#[derive(Debug, Clone)]
pub struct Freshness {
    as_of: NaiveDate,
    latest: BTreeMap<SourceKind, NaiveDate>,
    bad_dates: usize,
    samples: BTreeMap<SourceKind, VecDeque<String>>,
}

impl Freshness {
    /// Dates after `as_of` are treated as bad data.
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            latest: BTreeMap::new(),
            bad_dates: 0,
            samples: BTreeMap::new(),
        }
    }

    pub fn update(&mut self, fact: &Fact) {
        let fields = date_fields(fact.source);
        let candidate = if fields.is_empty() {
            Some(fact.last_updated.date())
        } else if fields.contains(&fact.name.as_str()) {
            date_spec_for(fact.source).and_then(|spec| spec.parse_value(&fact.value))
        } else {
            return;
        };

        match candidate {
            Some(date) if date <= self.as_of => {
                let latest = self.latest.entry(fact.source).or_insert(date);
                if date > *latest {
                    *latest = date;
                }
            }
            _ => self.record_bad_date(fact),
        }
    }

    fn record_bad_date(&mut self, fact: &Fact) {
        self.bad_dates += 1;
        let sample = self.samples.entry(fact.source).or_default();
        if sample.len() == SAMPLE_LIMIT {
            sample.pop_front();
        }
        sample.push_back(format!(
            "\"{}\" had a stored value of \"{}\" (event log updated {})",
            fact.fk, fact.value, fact.last_updated
        ));
    }

    pub fn latest(&self, source: SourceKind) -> Option<NaiveDate> {
        self.latest.get(&source).copied()
    }

    pub fn bad_dates(&self) -> usize {
        self.bad_dates
    }

    pub fn bad_date_samples(&self, source: SourceKind) -> impl Iterator<Item = &str> {
        self.samples
            .get(&source)
            .into_iter()
            .flat_map(|sample| sample.iter().map(String::as_str))
    }

    pub fn log_bad_dates(&self) {
        if self.bad_dates == 0 {
            return;
        }
        warn!(bad_dates = self.bad_dates, "found unusable freshness dates");
        for (source, sample) in &self.samples {
            for line in sample {
                warn!(%source, "{line}");
            }
        }
    }

    /// `source,freshness` rows, one per source with at least one good date.
    pub fn write_csv(&self, path: &Path) -> anyhow::Result<usize> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        writer
            .write_record(["source", "freshness"])
            .with_context(|| format!("writing {}", path.display()))?;
        for (source, date) in &self.latest {
            writer
                .write_record([source.name(), date.format("%Y-%m-%d").to_string().as_str()])
                .with_context(|| format!("writing {}", path.display()))?;
        }
        writer.flush().with_context(|| format!("flushing {}", path.display()))?;
        Ok(self.latest.len())
    }
}
