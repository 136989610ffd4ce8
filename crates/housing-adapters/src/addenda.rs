//! Permit addenda folded into one summary record per permit.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use housing_core::{parse_date_token, SourceKind, SourceRecord};

use crate::{read_raw_rows, AdapterError, FieldMap, RawRow, SourceAdapter};

const PERMIT_COLUMN: &str = "APPLICATION_NUMBER";
const ARRIVE_COLUMN: &str = "ARRIVE";

/// Unlike the direct sources, one output record summarizes every addendum row
/// of a permit: its number and the earliest arrival date.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAddendaSummary;

impl PermitAddendaSummary {
    pub fn summarize<I>(&self, rows: I) -> Vec<SourceRecord>
    where
        I: IntoIterator<Item = RawRow>,
    {
        // Permit order follows first appearance; `None` means no arrival
        // date parsed for that permit yet.
        let mut order: Vec<String> = Vec::new();
        let mut earliest: BTreeMap<String, Option<NaiveDate>> = BTreeMap::new();
        for row in rows {
            let Some(permit) = row.get(PERMIT_COLUMN).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
                continue;
            };
            let arrived = row
                .get(ARRIVE_COLUMN)
                .and_then(|raw| parse_date_token(raw, "%Y/%m/%d"));
            match earliest.get_mut(permit) {
                Some(current) => {
                    if let Some(arrived) = arrived {
                        if current.map_or(true, |seen| arrived < seen) {
                            *current = Some(arrived);
                        }
                    }
                }
                None => {
                    order.push(permit.to_string());
                    earliest.insert(permit.to_string(), arrived);
                }
            }
        }

        order
            .into_iter()
            .map(|permit| {
                let arrival = earliest
                    .get(&permit)
                    .copied()
                    .flatten()
                    .map(|date| date.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                let mut fields = FieldMap::new();
                fields.insert("permit_number".to_string(), permit.clone());
                fields.insert("earliest_addenda_arrival".to_string(), arrival);
                SourceRecord {
                    source: SourceKind::PermitAddendaSummary,
                    fk: SourceKind::PermitAddendaSummary.foreign_key(&permit),
                    fields,
                }
            })
            .collect()
    }
}

impl SourceAdapter for PermitAddendaSummary {
    fn source(&self) -> SourceKind {
        SourceKind::PermitAddendaSummary
    }

    fn fields(&self, row: &RawRow) -> FieldMap {
        let mut fields = FieldMap::new();
        if let Some(permit) = row.get(PERMIT_COLUMN).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            fields.insert("permit_number".to_string(), permit.to_string());
        }
        fields
    }

    fn foreign_key(&self, fields: &FieldMap) -> Option<String> {
        fields
            .get("permit_number")
            .map(|permit| SourceKind::PermitAddendaSummary.foreign_key(permit))
    }

    fn read_records(&self, path: &Path) -> Result<Vec<SourceRecord>, AdapterError> {
        Ok(self.summarize(read_raw_rows(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addendum(permit: &str, arrive: &str) -> RawRow {
        [
            (PERMIT_COLUMN.to_string(), permit.to_string()),
            (ARRIVE_COLUMN.to_string(), arrive.to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn keeps_the_earliest_parseable_arrival_per_permit() {
        let records = PermitAddendaSummary.summarize([
            addendum("201609218371", "2016/10/02 00:00:00"),
            addendum("201609218371", "2016/09/21"),
            addendum("201609218371", "not a date"),
            addendum("201701010001", "garbage"),
            addendum("", "2016/01/01"),
        ]);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fk, "permit_addenda_summary_201609218371");
        assert_eq!(records[0].get("earliest_addenda_arrival"), Some("2016-09-21"));
        assert_eq!(records[1].get("permit_number"), Some("201701010001"));
        assert_eq!(records[1].get("earliest_addenda_arrival"), Some(""));
    }
}
