//! Event log, UUID map and source download storage for the housing pipeline.

pub mod event_log;
pub mod fetch;
pub mod uuid_map;

use std::path::PathBuf;

use thiserror::Error;

pub use event_log::{read_facts, write_diff, write_dump, DiffSummary, RecordSnapshot, Snapshot};
pub use fetch::{
    BackoffPolicy, DownloadedSource, FetchError, HttpClientConfig, HttpFetcher, RetryDisposition,
    SourceFileStore,
};
pub use uuid_map::{fk_to_uuid, read_uuid_map, write_uuid_map, UuidMapRow};

pub const CRATE_NAME: &str = "housing-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} is missing required column `{column}`")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub(crate) fn column_index(
    path: &std::path::Path,
    headers: &csv::StringRecord,
    column: &'static str,
) -> Result<usize, StorageError> {
    headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim() == column)
        .ok_or_else(|| StorageError::MissingColumn {
            path: path.to_path_buf(),
            column,
        })
}
