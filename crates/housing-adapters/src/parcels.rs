//! Block/lot to map block/lot lookup.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::{header_index, AdapterError};

/// Built once at startup from a `blklot,mapblklot` reference file and handed
/// to whatever needs parcel grouping.
#[derive(Debug, Clone, Default)]
pub struct ParcelIndex {
    blklot_to_mapblklot: HashMap<String, String>,
}

impl ParcelIndex {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| AdapterError::io(path, err))?;
        Self::from_reader(file, path)
    }

    pub fn from_reader<R: Read>(reader: R, label: &Path) -> Result<Self, AdapterError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|err| AdapterError::csv(label, err))?
            .clone();
        let blklot_at = header_index(label, &headers, "blklot")?;
        let mapblklot_at = header_index(label, &headers, "mapblklot")?;

        let mut blklot_to_mapblklot = HashMap::new();
        for row in reader.records() {
            let row = row.map_err(|err| AdapterError::csv(label, err))?;
            let blklot = row.get(blklot_at).unwrap_or_default().trim();
            let mapblklot = row.get(mapblklot_at).unwrap_or_default().trim();
            if blklot.is_empty() || mapblklot.is_empty() {
                continue;
            }
            blklot_to_mapblklot.insert(blklot.to_string(), mapblklot.to_string());
        }
        debug!(path = %label.display(), parcels = blklot_to_mapblklot.len(), "loaded parcel index");
        Ok(Self { blklot_to_mapblklot })
    }

    pub fn insert(&mut self, blklot: impl Into<String>, mapblklot: impl Into<String>) {
        self.blklot_to_mapblklot.insert(blklot.into(), mapblklot.into());
    }

    pub fn mapblklot(&self, blklot: &str) -> Option<&str> {
        self.blklot_to_mapblklot.get(blklot).map(String::as_str)
    }

    /// Map block/lot for a `block` + `lot` pair, falling back to the plain
    /// concatenation when the parcel is not in the reference file.
    pub fn parcel_for(&self, block: &str, lot: &str) -> Option<String> {
        let (block, lot) = (block.trim(), lot.trim());
        if block.is_empty() || lot.is_empty() {
            return None;
        }
        let blklot = format!("{block}{lot}");
        Some(
            self.mapblklot(&blklot)
                .map(str::to_string)
                .unwrap_or(blklot),
        )
    }

    pub fn len(&self) -> usize {
        self.blklot_to_mapblklot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blklot_to_mapblklot.is_empty()
    }
}
