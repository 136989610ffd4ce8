//! Source adapter contracts and the static catalog of municipal datasets.

mod addenda;
mod address;
mod catalog;
mod parcels;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use housing_core::{SourceKind, SourceRecord};
use thiserror::Error;
use tracing::{debug, warn};

pub use addenda::PermitAddendaSummary;
pub use address::{AddressNormalizer, BasicAddressNormalizer};
pub use catalog::{date_spec_for, DateSpec, DirectSource, BMR_DATE, PLANNING_DATE, PTS_DATE, TCO_DATE};
pub use parcels::ParcelIndex;

pub const CRATE_NAME: &str = "housing-adapters";

/// One input row keyed by its header.
pub type RawRow = HashMap<String, String>;

/// Allow-listed output fields of a decoded record.
pub type FieldMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed csv in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no `{column}` column")]
    MissingColumn { path: PathBuf, column: &'static str },
}

impl AdapterError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Allow-listed fields of `row`, renamed to their output names, blank
    /// values dropped, plus the computed `address_norm` when one resolves.
    fn fields(&self, row: &RawRow) -> FieldMap;

    /// `None` when a field the key is built from is missing.
    fn foreign_key(&self, fields: &FieldMap) -> Option<String>;

    fn reference_date(&self, _fields: &FieldMap) -> Option<NaiveDate> {
        None
    }

    fn read_records(&self, path: &Path) -> Result<Vec<SourceRecord>, AdapterError> {
        let source = self.source();
        let mut records = Vec::new();
        let mut keyless = 0usize;
        for row in read_raw_rows(path)? {
            let fields = self.fields(&row);
            match self.foreign_key(&fields) {
                Some(fk) => records.push(SourceRecord { source, fk, fields }),
                None => keyless += 1,
            }
        }
        if keyless > 0 {
            warn!(%source, path = %path.display(), keyless, "skipped rows without a usable foreign key");
        }
        debug!(%source, records = records.len(), "decoded source file");
        Ok(records)
    }
}

pub fn adapter_for_source(source: SourceKind) -> Box<dyn SourceAdapter> {
    match DirectSource::for_kind(source) {
        Some(direct) => Box::new(direct),
        None => Box::new(PermitAddendaSummary),
    }
}

/// Read a CSV file into header-keyed rows. Short rows are tolerated and
/// invalid UTF-8 is replaced.
pub fn read_raw_rows(path: &Path) -> Result<Vec<RawRow>, AdapterError> {
    let file = File::open(path).map_err(|err| AdapterError::io(path, err))?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|err| AdapterError::csv(path, err))?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record.map_err(|err| AdapterError::csv(path, err))?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.clone(), String::from_utf8_lossy(value).into_owned()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub(crate) fn header_index(
    path: &Path,
    headers: &csv::StringRecord,
    column: &'static str,
) -> Result<usize, AdapterError> {
    headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim() == column)
        .ok_or_else(|| AdapterError::MissingColumn {
            path: path.to_path_buf(),
            column,
        })
}
