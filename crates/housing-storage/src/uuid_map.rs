//! `uuid,fk` table persisted between record graph runs.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use tracing::warn;
use uuid::Uuid;

use crate::{column_index, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidMapRow {
    pub uuid: Uuid,
    pub fk: String,
}

pub fn read_uuid_map(path: impl AsRef<Path>) -> Result<Vec<UuidMapRow>, StorageError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| StorageError::io(path, err))?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader
        .headers()
        .map_err(|err| StorageError::csv(path, err))?
        .clone();
    let uuid_at = column_index(path, &headers, "uuid")?;
    let fk_at = column_index(path, &headers, "fk")?;

    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| StorageError::csv(path, err))?;
        let fk = row.get(fk_at).unwrap_or_default().trim();
        let raw_uuid = row.get(uuid_at).unwrap_or_default().trim();
        if fk.is_empty() {
            continue;
        }
        match Uuid::parse_str(raw_uuid) {
            Ok(uuid) => rows.push(UuidMapRow {
                uuid,
                fk: fk.to_string(),
            }),
            Err(err) => warn!(fk, uuid = raw_uuid, %err, "skipping malformed uuid map row"),
        }
    }
    Ok(rows)
}

pub fn write_uuid_map(path: impl AsRef<Path>, rows: &[UuidMapRow]) -> Result<(), StorageError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| StorageError::io(path, err))?;
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(file);
    writer
        .write_record(["uuid", "fk"])
        .map_err(|err| StorageError::csv(path, err))?;
    for row in rows {
        writer
            .write_record([row.uuid.to_string().as_str(), row.fk.as_str()])
            .map_err(|err| StorageError::csv(path, err))?;
    }
    writer.flush().map_err(|err| StorageError::io(path, err))?;
    Ok(())
}

/// Lookup from foreign key to project uuid; later rows win duplicates.
pub fn fk_to_uuid(rows: &[UuidMapRow]) -> HashMap<String, Uuid> {
    rows.iter().map(|row| (row.fk.clone(), row.uuid)).collect()
}
