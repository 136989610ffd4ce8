//! Append-only `fk,source,last_updated,name,value` event log.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use housing_core::{parse_timestamp, Fact, SourceKind, SourceRecord};
use tracing::{debug, warn};

use crate::{column_index, StorageError};

pub const EVENT_LOG_HEADER: [&str; 5] = ["fk", "source", "last_updated", "name", "value"];

pub fn read_facts(path: impl AsRef<Path>) -> Result<Vec<Fact>, StorageError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| StorageError::io(path, err))?;
    read_facts_from(file, path)
}

/// Rows naming an unknown source or carrying an unparseable `last_updated`
/// are skipped with a warning; everything else is kept in file order.
pub fn read_facts_from<R: Read>(reader: R, label: &Path) -> Result<Vec<Fact>, StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = reader
        .headers()
        .map_err(|err| StorageError::csv(label, err))?
        .clone();
    let fk_at = column_index(label, &headers, "fk")?;
    let source_at = column_index(label, &headers, "source")?;
    let updated_at = column_index(label, &headers, "last_updated")?;
    let name_at = column_index(label, &headers, "name")?;
    let value_at = column_index(label, &headers, "value")?;

    let mut facts = Vec::new();
    let mut skipped = 0usize;
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|err| StorageError::csv(label, err))?;
        let cell = |at: usize| row.get(at).unwrap_or_default();

        let Some(source) = SourceKind::from_name(cell(source_at)) else {
            warn!(fk = cell(fk_at), source = cell(source_at), line, "unknown source in event log");
            skipped += 1;
            continue;
        };
        let Some(last_updated) = parse_timestamp(cell(updated_at)) else {
            warn!(
                fk = cell(fk_at),
                field = cell(name_at),
                last_updated = cell(updated_at),
                "unparseable last_updated in event log"
            );
            skipped += 1;
            continue;
        };
        facts.push(Fact {
            fk: cell(fk_at).to_string(),
            source,
            last_updated,
            name: cell(name_at).to_string(),
            value: cell(value_at).to_string(),
        });
    }
    debug!(path = %label.display(), facts = facts.len(), skipped, "read event log");
    Ok(facts)
}

/// Latest known values for one `(source, fk)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub source: SourceKind,
    pub fk: String,
    /// Earliest `last_updated` among the record's facts.
    pub first_seen: NaiveDateTime,
    fields: BTreeMap<String, (String, NaiveDateTime)>,
}

impl RecordSnapshot {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|(value, _)| value.as_str())
    }

    /// Non-empty value of `name`, trimmed.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, (value, _))| (name.as_str(), value.as_str()))
    }

    fn apply(&mut self, name: &str, value: &str, last_updated: NaiveDateTime) {
        self.first_seen = self.first_seen.min(last_updated);
        match self.fields.get_mut(name) {
            // Later rows win exact timestamp ties.
            Some(current) if last_updated >= current.1 => {
                *current = (value.to_string(), last_updated);
            }
            Some(_) => {}
            None => {
                self.fields
                    .insert(name.to_string(), (value.to_string(), last_updated));
            }
        }
    }
}

/// Replay of an event log into latest-value records. Sources iterate in the
/// order they were first seen, and records within a source likewise.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Vec<RecordSnapshot>,
    index: HashMap<(SourceKind, String), usize>,
    by_source: Vec<(SourceKind, Vec<usize>)>,
}

impl Snapshot {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self::from_facts(&read_facts(path)?))
    }

    pub fn from_facts<'a>(facts: impl IntoIterator<Item = &'a Fact>) -> Self {
        let mut snapshot = Self::default();
        for fact in facts {
            snapshot.apply(fact);
        }
        snapshot
    }

    pub fn apply(&mut self, fact: &Fact) {
        let at = self.slot(fact.source, &fact.fk, fact.last_updated);
        self.records[at].apply(&fact.name, &fact.value, fact.last_updated);
    }

    fn slot(&mut self, source: SourceKind, fk: &str, last_updated: NaiveDateTime) -> usize {
        if let Some(&at) = self.index.get(&(source, fk.to_string())) {
            return at;
        }
        let at = self.records.len();
        self.records.push(RecordSnapshot {
            source,
            fk: fk.to_string(),
            first_seen: last_updated,
            fields: BTreeMap::new(),
        });
        self.index.insert((source, fk.to_string()), at);
        match self.by_source.iter_mut().find(|(kind, _)| *kind == source) {
            Some((_, members)) => members.push(at),
            None => self.by_source.push((source, vec![at])),
        }
        at
    }

    pub fn get(&self, source: SourceKind, fk: &str) -> Option<&RecordSnapshot> {
        self.index
            .get(&(source, fk.to_string()))
            .map(|&at| &self.records[at])
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.by_source.iter().map(|(kind, _)| *kind)
    }

    pub fn records(&self, source: SourceKind) -> impl Iterator<Item = &RecordSnapshot> {
        self.by_source
            .iter()
            .filter(move |(kind, _)| *kind == source)
            .flat_map(move |(_, members)| members.iter().map(move |&at| &self.records[at]))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordSnapshot> {
        self.by_source
            .iter()
            .flat_map(move |(_, members)| members.iter().map(move |&at| &self.records[at]))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn event_log_writer<W: std::io::Write>(inner: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(inner)
}

fn write_row<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    path: &Path,
    record: &SourceRecord,
    last_updated: &str,
    name: &str,
    value: &str,
) -> Result<(), StorageError> {
    writer
        .write_record([record.fk.as_str(), record.source.name(), last_updated, name, value])
        .map_err(|err| StorageError::csv(path, err))
}

/// Write a fresh event log holding every non-empty field of `records`.
pub fn write_dump(
    out: impl AsRef<Path>,
    records: &[SourceRecord],
    last_updated: NaiveDate,
) -> Result<usize, StorageError> {
    let out = out.as_ref();
    let file = File::create(out).map_err(|err| StorageError::io(out, err))?;
    let mut writer = event_log_writer(file);
    writer
        .write_record(EVENT_LOG_HEADER)
        .map_err(|err| StorageError::csv(out, err))?;

    let stamp = last_updated.format("%Y-%m-%d").to_string();
    let mut rows = 0usize;
    for record in records {
        for (name, value) in &record.fields {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            write_row(&mut writer, out, record, &stamp, name, value)?;
            rows += 1;
        }
    }
    writer.flush().map_err(|err| StorageError::io(out, err))?;
    Ok(rows)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub prior_records: usize,
    pub new_records: usize,
    pub appended_rows: usize,
}

/// Copy `prior` to `out` and append only the values that differ from the
/// prior log's latest snapshot. A field that was set before and is now blank
/// or missing is appended with an empty value.
pub fn write_diff(
    prior: impl AsRef<Path>,
    out: impl AsRef<Path>,
    records: &[SourceRecord],
    last_updated: NaiveDate,
) -> Result<DiffSummary, StorageError> {
    let prior = prior.as_ref();
    let out = out.as_ref();
    let mut snapshot = Snapshot::read(prior)?;
    let mut summary = DiffSummary {
        prior_records: snapshot.len(),
        ..DiffSummary::default()
    };

    let same_file = match (fs::canonicalize(prior), fs::canonicalize(out)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_file {
        fs::copy(prior, out).map_err(|err| StorageError::io(out, err))?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(out)
        .map_err(|err| StorageError::io(out, err))?;
    if !ends_with_newline(&mut file).map_err(|err| StorageError::io(out, err))? {
        std::io::Write::write_all(&mut file, b"\n").map_err(|err| StorageError::io(out, err))?;
    }

    let stamp = last_updated.format("%Y-%m-%d").to_string();
    let timestamp = last_updated.and_hms_opt(0, 0, 0).unwrap_or_default();
    let mut writer = event_log_writer(file);
    for record in records {
        // Fields the prior log holds a value for but this batch left blank
        // or dropped; they are appended as empty values.
        let cleared: Vec<String> = match snapshot.get(record.source, &record.fk) {
            Some(known) => known
                .fields()
                .filter(|(name, value)| {
                    !value.trim().is_empty()
                        && record.fields.get(*name).is_none_or(|now| now.trim().is_empty())
                })
                .map(|(name, _)| name.to_string())
                .collect(),
            None => {
                summary.new_records += 1;
                Vec::new()
            }
        };
        let changes = record
            .fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.trim()))
            .filter(|(_, value)| !value.is_empty())
            .chain(cleared.iter().map(|name| (name.as_str(), "")));
        for (name, value) in changes {
            let unchanged = snapshot
                .get(record.source, &record.fk)
                .and_then(|known| known.get(name))
                .is_some_and(|known| known == value);
            if unchanged {
                continue;
            }
            write_row(&mut writer, out, record, &stamp, name, value)?;
            snapshot.apply(&Fact {
                fk: record.fk.clone(),
                source: record.source,
                last_updated: timestamp,
                name: name.to_string(),
                value: value.to_string(),
            });
            summary.appended_rows += 1;
        }
    }
    writer.flush().map_err(|err| StorageError::io(out, err))?;
    Ok(summary)
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
