//! Linkage rules turning latest-value records into a record graph.

use std::collections::HashMap;

use chrono::NaiveDate;
use housing_adapters::{date_spec_for, ParcelIndex};
use housing_core::SourceKind;
use housing_storage::{RecordSnapshot, Snapshot, UuidMapRow};
use tracing::{debug, info_span};

use crate::graph::RecordGraph;

/// Reference date of a record: its declared date field when the source has
/// one, otherwise the day it first appeared in the event log.
pub fn reference_date(record: &RecordSnapshot) -> Option<NaiveDate> {
    match date_spec_for(record.source) {
        Some(spec) => record
            .non_empty(spec.field)
            .and_then(|raw| spec.parse_value(raw)),
        None => Some(record.first_seen.date()),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn split_case_numbers(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|item| !item.is_empty())
}

#[derive(Debug, Default, Clone, Copy)]
struct LinkCounts {
    planning_hierarchy: usize,
    planning_permits: usize,
    tco: usize,
    addenda: usize,
    mohcd_planning: usize,
    inclusionary_pipeline: usize,
    permit_groups: usize,
}

pub struct RecordGraphBuilder<'a> {
    snapshot: &'a Snapshot,
    parcels: &'a ParcelIndex,
    prior: &'a [UuidMapRow],
}

impl<'a> RecordGraphBuilder<'a> {
    pub fn new(snapshot: &'a Snapshot, parcels: &'a ParcelIndex) -> Self {
        Self {
            snapshot,
            parcels,
            prior: &[],
        }
    }

    pub fn with_prior(mut self, prior: &'a [UuidMapRow]) -> Self {
        self.prior = prior;
        self
    }

    /// Nodes in snapshot order, then every linkage rule, then the prior
    /// identifiers. Identifiers are not assigned here.
    pub fn build(&self) -> RecordGraph {
        let _span = info_span!("build_record_graph", records = self.snapshot.len()).entered();
        let mut graph = RecordGraph::new();
        for record in self.snapshot.iter() {
            graph.add(&record.fk, reference_date(record));
        }

        let pts_by_permit = self.pts_by_permit();
        let mut counts = LinkCounts::default();
        self.link_planning_hierarchy(&mut graph, &mut counts);
        self.link_planning_permits(&mut graph, &pts_by_permit, &mut counts);
        self.link_permit_children(&mut graph, &pts_by_permit, &mut counts);
        self.link_mohcd(&mut graph, &mut counts);
        self.link_permit_groups(&mut graph, &mut counts);
        debug!(?counts, nodes = graph.len(), "linked records");

        if !self.prior.is_empty() {
            graph.seed_uuids(self.prior);
        }
        graph
    }

    fn pts_by_permit(&self) -> HashMap<&'a str, Vec<&'a str>> {
        let mut by_permit: HashMap<&str, Vec<&str>> = HashMap::new();
        for record in self.snapshot.records(SourceKind::Pts) {
            if let Some(permit) = record.non_empty("permit_number") {
                by_permit.entry(permit).or_default().push(record.fk.as_str());
            }
        }
        by_permit
    }

    fn link_planning_hierarchy(&self, graph: &mut RecordGraph, counts: &mut LinkCounts) {
        for record in self.snapshot.records(SourceKind::Planning) {
            for parent in record.get("parent").into_iter().flat_map(split_list) {
                graph.link(&SourceKind::Planning.foreign_key(parent), &record.fk);
                counts.planning_hierarchy += 1;
            }
            for child in record.get("children").into_iter().flat_map(split_list) {
                graph.link(&record.fk, &SourceKind::Planning.foreign_key(child));
                counts.planning_hierarchy += 1;
            }
        }
    }

    // A permit is assumed to belong to a single planning record; when several
    // list it, the last one listed wins.
    fn link_planning_permits(
        &self,
        graph: &mut RecordGraph,
        pts_by_permit: &HashMap<&str, Vec<&str>>,
        counts: &mut LinkCounts,
    ) {
        let mut permit_owner: HashMap<&str, &str> = HashMap::new();
        let mut permit_order: Vec<&str> = Vec::new();
        for record in self.snapshot.records(SourceKind::Planning) {
            for permit in record.get("building_permit_number").into_iter().flat_map(split_list) {
                if permit_owner.insert(permit, record.fk.as_str()).is_none() {
                    permit_order.push(permit);
                }
            }
        }
        for permit in permit_order {
            let (Some(owner), Some(permits)) = (permit_owner.get(permit), pts_by_permit.get(permit)) else {
                continue;
            };
            for pts in permits {
                graph.link(owner, pts);
                counts.planning_permits += 1;
            }
        }
    }

    fn link_permit_children(
        &self,
        graph: &mut RecordGraph,
        pts_by_permit: &HashMap<&str, Vec<&str>>,
        counts: &mut LinkCounts,
    ) {
        for record in self.snapshot.records(SourceKind::Tco) {
            let Some(permits) = record
                .non_empty("building_permit_number")
                .and_then(|permit| pts_by_permit.get(permit))
            else {
                continue;
            };
            for pts in permits {
                graph.link(pts, &record.fk);
                counts.tco += 1;
            }
        }
        for record in self.snapshot.records(SourceKind::PermitAddendaSummary) {
            let Some(permits) = record
                .non_empty("permit_number")
                .and_then(|permit| pts_by_permit.get(permit))
            else {
                continue;
            };
            for pts in permits {
                graph.link(pts, &record.fk);
                counts.addenda += 1;
            }
        }
    }

    fn planning_record_for_case(&self, case: &str) -> Option<String> {
        [case.to_string(), format!("{case}PRJ")]
            .into_iter()
            .map(|id| SourceKind::Planning.foreign_key(&id))
            .find(|fk| self.snapshot.get(SourceKind::Planning, fk).is_some())
    }

    fn link_mohcd(&self, graph: &mut RecordGraph, counts: &mut LinkCounts) {
        for source in [SourceKind::MohcdPipeline, SourceKind::MohcdInclusionary] {
            for record in self.snapshot.records(source) {
                for case in record.get("planning_case_number").into_iter().flat_map(split_case_numbers) {
                    if let Some(planning) = self.planning_record_for_case(case) {
                        graph.link(&planning, &record.fk);
                        counts.mohcd_planning += 1;
                    }
                }
            }
        }

        for record in self.snapshot.records(SourceKind::MohcdInclusionary) {
            let Some(project_id) = record.non_empty("project_id") else {
                continue;
            };
            let pipeline = SourceKind::MohcdPipeline.foreign_key(project_id);
            if self.snapshot.get(SourceKind::MohcdPipeline, &pipeline).is_some() {
                graph.link(&pipeline, &record.fk);
                counts.inclusionary_pipeline += 1;
            }
        }
    }

    /// Permits filed on the same day, for the same parcel and the same use are
    /// treated as one project, anchored on the first such permit seen.
    fn link_permit_groups(&self, graph: &mut RecordGraph, counts: &mut LinkCounts) {
        let mut anchors: HashMap<(String, &str, &str), &str> = HashMap::new();
        for record in self.snapshot.records(SourceKind::Pts) {
            let parcel = match record.non_empty("mapblklot") {
                Some(mapblklot) => Some(mapblklot.to_string()),
                None => self.parcels.parcel_for(
                    record.get("block").unwrap_or_default(),
                    record.get("lot").unwrap_or_default(),
                ),
            };
            let (Some(parcel), Some(filed), Some(used_as)) = (
                parcel,
                record.non_empty("filed_date"),
                record.non_empty("proposed_use"),
            ) else {
                continue;
            };
            match anchors.get(&(parcel.clone(), filed, used_as)) {
                Some(anchor) => {
                    graph.link(anchor, &record.fk);
                    counts.permit_groups += 1;
                }
                None => {
                    anchors.insert((parcel, filed, used_as), record.fk.as_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use housing_core::{parse_timestamp, Fact};

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).expect("timestamp")
    }

    fn facts(rows: &[(SourceKind, &str, &str, &str)]) -> Snapshot {
        let facts: Vec<Fact> = rows
            .iter()
            .map(|(source, id, name, value)| Fact {
                fk: source.foreign_key(id),
                source: *source,
                last_updated: ts("2020-01-01"),
                name: (*name).to_string(),
                value: (*value).to_string(),
            })
            .collect();
        Snapshot::from_facts(&facts)
    }

    fn parents_of<'g>(graph: &'g RecordGraph, fk: &str) -> Vec<&'g str> {
        graph
            .get(fk)
            .map(|node| node.parents.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[test]
    fn planning_parent_and_children_lists_become_edges() {
        let snapshot = facts(&[
            (SourceKind::Planning, "2016-001PRJ", "date_opened", "01/02/2016"),
            (SourceKind::Planning, "2016-001PRJ", "children", "2016-001ENV, 2016-001CUA,"),
            (SourceKind::Planning, "2016-001ENV", "date_opened", "01/03/2016"),
            (SourceKind::Planning, "2016-001VAR", "parent", "2016-001PRJ"),
            (SourceKind::Planning, "2016-001VAR", "date_opened", "not a date"),
        ]);
        let graph = RecordGraphBuilder::new(&snapshot, &ParcelIndex::default()).build();

        assert_eq!(parents_of(&graph, "planning_2016-001ENV"), vec!["planning_2016-001PRJ"]);
        assert_eq!(parents_of(&graph, "planning_2016-001CUA"), vec!["planning_2016-001PRJ"]);
        assert_eq!(parents_of(&graph, "planning_2016-001VAR"), vec!["planning_2016-001PRJ"]);
        assert_eq!(graph.get("planning_2016-001CUA").and_then(|n| n.reference_date), None);
        assert_eq!(graph.get("planning_2016-001VAR").and_then(|n| n.reference_date), None);
        assert_eq!(
            graph.get("planning_2016-001PRJ").and_then(|n| n.reference_date),
            NaiveDate::from_ymd_opt(2016, 1, 2)
        );
    }

    #[test]
    fn permits_attach_to_the_last_planning_record_listing_them() {
        let snapshot = facts(&[
            (SourceKind::Planning, "A", "building_permit_number", "201601011111,201601012222"),
            (SourceKind::Planning, "B", "building_permit_number", "201601012222"),
            (SourceKind::Pts, "1", "permit_number", "201601011111"),
            (SourceKind::Pts, "2", "permit_number", "201601012222"),
            (SourceKind::Pts, "3", "permit_number", "201601019999"),
        ]);
        let graph = RecordGraphBuilder::new(&snapshot, &ParcelIndex::default()).build();

        assert_eq!(parents_of(&graph, "pts_1"), vec!["planning_A"]);
        assert_eq!(parents_of(&graph, "pts_2"), vec!["planning_B"]);
        assert!(parents_of(&graph, "pts_3").is_empty());
    }

    #[test]
    fn certificates_and_addenda_hang_off_every_matching_permit() {
        let snapshot = facts(&[
            (SourceKind::Pts, "1", "permit_number", "201705237369"),
            (SourceKind::Pts, "2", "permit_number", "201705237369"),
            (SourceKind::Tco, "201705237369_2018-05-01", "building_permit_number", "201705237369"),
            (SourceKind::Tco, "999_2018-05-01", "building_permit_number", "999"),
            (SourceKind::PermitAddendaSummary, "201705237369", "permit_number", "201705237369"),
        ]);
        let graph = RecordGraphBuilder::new(&snapshot, &ParcelIndex::default()).build();

        assert_eq!(parents_of(&graph, "tco_201705237369_2018-05-01"), vec!["pts_1", "pts_2"]);
        assert!(parents_of(&graph, "tco_999_2018-05-01").is_empty());
        assert_eq!(
            parents_of(&graph, "permit_addenda_summary_201705237369"),
            vec!["pts_1", "pts_2"]
        );
    }

    #[test]
    fn mohcd_records_link_through_case_numbers_and_project_ids() {
        let snapshot = facts(&[
            (SourceKind::Planning, "2011.0218", "date_opened", "01/01/2011"),
            (SourceKind::Planning, "2015-014058PRJ", "date_opened", "01/01/2015"),
            (SourceKind::MohcdPipeline, "2011-005", "planning_case_number", "2011.0218; 2015-014058 bogus"),
            (SourceKind::MohcdInclusionary, "2011-005", "project_id", "2011-005"),
            (SourceKind::MohcdInclusionary, "2011-005", "planning_case_number", "missing"),
        ]);
        let graph = RecordGraphBuilder::new(&snapshot, &ParcelIndex::default()).build();

        assert_eq!(
            parents_of(&graph, "mohcd_pipeline_2011-005"),
            vec!["planning_2011.0218", "planning_2015-014058PRJ"]
        );
        assert_eq!(
            parents_of(&graph, "mohcd_inclusionary_2011-005"),
            vec!["mohcd_pipeline_2011-005"]
        );
        assert!(!graph.contains("planning_bogus"));
    }

    #[test]
    fn same_parcel_day_and_use_permits_form_a_group() {
        let mut parcels = ParcelIndex::default();
        parcels.insert("3721014", "3721001");
        parcels.insert("3721015", "3721001");
        let snapshot = facts(&[
            (SourceKind::Pts, "1", "block", "3721"),
            (SourceKind::Pts, "1", "lot", "014"),
            (SourceKind::Pts, "1", "filed_date", "09/21/2016"),
            (SourceKind::Pts, "1", "proposed_use", "apartments"),
            (SourceKind::Pts, "2", "block", "3721"),
            (SourceKind::Pts, "2", "lot", "015"),
            (SourceKind::Pts, "2", "filed_date", "09/21/2016"),
            (SourceKind::Pts, "2", "proposed_use", "apartments"),
            (SourceKind::Pts, "3", "block", "3721"),
            (SourceKind::Pts, "3", "lot", "014"),
            (SourceKind::Pts, "3", "filed_date", "09/21/2016"),
            (SourceKind::Pts, "3", "proposed_use", "retail"),
            (SourceKind::Pts, "4", "block", "3721"),
            (SourceKind::Pts, "4", "filed_date", "09/21/2016"),
            (SourceKind::Pts, "4", "proposed_use", "apartments"),
        ]);
        let graph = RecordGraphBuilder::new(&snapshot, &parcels).build();

        assert_eq!(parents_of(&graph, "pts_2"), vec!["pts_1"]);
        assert!(parents_of(&graph, "pts_1").is_empty());
        assert!(parents_of(&graph, "pts_3").is_empty());
        assert!(parents_of(&graph, "pts_4").is_empty());
    }

    #[test]
    fn undated_sources_fall_back_to_first_seen() {
        let snapshot = facts(&[(SourceKind::MohcdPipeline, "2011-005", "project_id", "2011-005")]);
        let graph = RecordGraphBuilder::new(&snapshot, &ParcelIndex::default()).build();
        assert_eq!(
            graph.get("mohcd_pipeline_2011-005").and_then(|n| n.reference_date),
            NaiveDate::from_ymd_opt(2020, 1, 1)
        );
    }
}
