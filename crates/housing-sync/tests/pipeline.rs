use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use housing_adapters::ParcelIndex;
use housing_core::SourceKind;
use housing_storage::read_uuid_map;
use housing_sync::{create_event_log, create_uuid_map, process_event_log, RelationalOptions};
use tempfile::tempdir;

const PLANNING: &str = "\
record_id,record_name,address,date_opened,RELATED_BUILDING_PERMIT,PRJ_FEATURE_MARKET_RATE_NET,PRJ_FEATURE_AFFORDABLE_NET
2016-001PRJ,One Main,1 Main St,01/02/2016,201601010001,10,2
2017-002PRJ,Nine Oak,9 Oak St,03/04/2017,,5,
";

const PTS: &str = "\
Record ID,Permit Number,Permit Type,Block,Lot,Filed Date,Proposed Use,Existing Units,Proposed Units
1001,201601010001,1,3721,014,01/05/2016,apartments,0,12
1002,201801010002,8,1000,001,02/02/2018,,0,1
";

const TCO: &str = "\
Building Permit Application Number,Building Address,Date Issued,Document Type,Number of Units Certified
201601010001,1 Main St,2018/06/01,CFC,12
";

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("date")
}

fn write_inputs(dir: &Path, planning: &str) -> Vec<(SourceKind, PathBuf)> {
    let files = [
        (SourceKind::Planning, "planning.csv", planning),
        (SourceKind::Pts, "pts.csv", PTS),
        (SourceKind::Tco, "tco.csv", TCO),
    ];
    files
        .into_iter()
        .map(|(source, name, body)| {
            let path = dir.join(name);
            std::fs::write(&path, body).expect("write input");
            (source, path)
        })
        .collect()
}

fn uuids_by_fk(path: &Path) -> BTreeMap<String, uuid::Uuid> {
    read_uuid_map(path)
        .expect("uuid map")
        .into_iter()
        .map(|row| (row.fk, row.uuid))
        .collect()
}

#[test]
fn full_pipeline_links_records_and_writes_tables() {
    let dir = tempdir().expect("tempdir");
    let inputs = write_inputs(dir.path(), PLANNING);
    let event_log = dir.path().join("event_log.csv");
    let uuid_map = dir.path().join("uuid_map.csv");
    let out_dir = dir.path().join("tables");
    let parcels = ParcelIndex::default();

    let logged = create_event_log(&inputs, None, &event_log, day(2020, 5, 1)).expect("event log");
    assert_eq!(logged.records, 5);
    assert!(logged.rows_written > 0);
    assert_eq!(logged.new_records, None);

    let mapped = create_uuid_map(&event_log, None, &parcels, &uuid_map).expect("uuid map");
    assert_eq!(mapped.records, 5);
    assert_eq!(mapped.assignment.components, 3);
    assert_eq!(mapped.assignment.minted, 3);

    let uuids = uuids_by_fk(&uuid_map);
    let first = uuids["planning_2016-001PRJ"];
    assert_eq!(uuids["pts_1001"], first);
    assert_eq!(uuids["tco_201601010001_2018-06-01"], first);
    assert_ne!(uuids["planning_2017-002PRJ"], first);
    assert_ne!(uuids["pts_1002"], first);
    assert_ne!(uuids["pts_1002"], uuids["planning_2017-002PRJ"]);

    let options = RelationalOptions {
        require_planning_root: true,
        as_of: day(2020, 6, 1),
    };
    let summary = process_event_log(&event_log, &uuid_map, &parcels, &out_dir, &options).expect("relational");
    assert_eq!(summary.projects, 2);
    assert_eq!(summary.skipped_projects, 1);
    assert_eq!(summary.unmapped_records, 0);
    assert_eq!(summary.seen_projects, 2);

    let names: Vec<&str> = summary.tables.iter().map(|t| t.name).collect();
    assert_eq!(
        names,
        vec!["project_facts", "project_unit_counts_full", "project_geo", "project_details"]
    );
    for table in &summary.tables {
        assert!(table.path.exists(), "{} missing", table.path.display());
    }

    let facts = std::fs::read_to_string(out_dir.join("project_facts.csv")).expect("facts");
    assert!(facts.starts_with("id,address,applicant,"));
    assert!(facts.contains(&format!("{first},1 Main St,")));
    assert!(facts.contains(",12,dbi,2,planning"));
    assert!(facts.contains(",5,planning,,"));

    let freshness = std::fs::read_to_string(out_dir.join("data_freshness.csv")).expect("freshness");
    assert_eq!(
        freshness,
        "source,freshness\nplanning,2017-03-04\npts,2018-02-02\ntco,2018-06-01\n"
    );

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&summary.manifest_path).expect("manifest")).expect("json");
    let files = manifest["files"].as_array().expect("files");
    assert_eq!(files.len(), 5);
    assert!(files
        .iter()
        .all(|file| file["sha256"].as_str().is_some_and(|sha| sha.len() == 64)));
    assert_eq!(manifest["skipped_projects"], 1);
}

#[test]
fn rerun_keeps_identifiers_and_diffs_only_changes() {
    let dir = tempdir().expect("tempdir");
    let parcels = ParcelIndex::default();
    let first_inputs = write_inputs(dir.path(), PLANNING);
    let first_log = dir.path().join("event_log_1.csv");
    let first_map = dir.path().join("uuid_map_1.csv");
    create_event_log(&first_inputs, None, &first_log, day(2020, 5, 1)).expect("event log");
    create_uuid_map(&first_log, None, &parcels, &first_map).expect("uuid map");

    let changed = PLANNING.replace("Nine Oak,9 Oak St,03/04/2017,,5,", "Nine Oak,9 Oak St,03/04/2017,,6,");
    let second_inputs = write_inputs(dir.path(), &changed);
    let second_log = dir.path().join("event_log_2.csv");
    let second_map = dir.path().join("uuid_map_2.csv");
    let diffed = create_event_log(&second_inputs, Some(&first_log), &second_log, day(2020, 6, 1)).expect("diff");
    assert_eq!(diffed.rows_written, 1);
    assert_eq!(diffed.new_records, Some(0));

    let remapped = create_uuid_map(&second_log, Some(&first_map), &parcels, &second_map).expect("uuid map");
    assert_eq!(remapped.prior_rows, 5);
    assert_eq!(remapped.seeded, 5);
    assert_eq!(remapped.assignment.minted, 0);
    assert_eq!(uuids_by_fk(&first_map), uuids_by_fk(&second_map));

    let distinct: BTreeSet<_> = uuids_by_fk(&second_map).into_values().collect();
    assert_eq!(distinct.len(), 3);
}

#[test]
fn projects_without_planning_roots_are_kept_when_not_required() {
    let dir = tempdir().expect("tempdir");
    let parcels = ParcelIndex::default();
    let inputs = write_inputs(dir.path(), PLANNING);
    let event_log = dir.path().join("event_log.csv");
    let uuid_map = dir.path().join("uuid_map.csv");
    create_event_log(&inputs, None, &event_log, day(2020, 5, 1)).expect("event log");
    create_uuid_map(&event_log, None, &parcels, &uuid_map).expect("uuid map");

    let options = RelationalOptions {
        require_planning_root: false,
        as_of: day(2020, 6, 1),
    };
    let summary = process_event_log(&event_log, &uuid_map, &parcels, &dir.path().join("out"), &options)
        .expect("relational");
    assert_eq!(summary.projects, 3);
    assert_eq!(summary.skipped_projects, 0);
}

#[test]
fn records_missing_from_the_uuid_map_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let parcels = ParcelIndex::default();
    let inputs = write_inputs(dir.path(), PLANNING);
    let event_log = dir.path().join("event_log.csv");
    let uuid_map = dir.path().join("uuid_map.csv");
    create_event_log(&inputs, None, &event_log, day(2020, 5, 1)).expect("event log");
    create_uuid_map(&event_log, None, &parcels, &uuid_map).expect("uuid map");

    let trimmed: String = std::fs::read_to_string(&uuid_map)
        .expect("read")
        .lines()
        .filter(|line| !line.ends_with(",pts_1002"))
        .map(|line| format!("{line}\n"))
        .collect();
    std::fs::write(&uuid_map, trimmed).expect("write");

    let options = RelationalOptions {
        require_planning_root: true,
        as_of: day(2020, 6, 1),
    };
    let summary = process_event_log(&event_log, &uuid_map, &parcels, &dir.path().join("out"), &options)
        .expect("relational");
    assert_eq!(summary.unmapped_records, 1);
    assert_eq!(summary.projects, 2);
    assert_eq!(summary.skipped_projects, 0);
}

#[test]
fn clearing_a_planning_parent_splits_the_project_on_rerun() {
    const LINKED: &str = "\
record_id,record_name,address,date_opened,parent
2016-001PRJ,One Main,1 Main St,01/02/2016,
2017-002ENV,One Main env,1 Main St,03/04/2017,2016-001PRJ
";
    let dir = tempdir().expect("tempdir");
    let parcels = ParcelIndex::default();
    let planning = dir.path().join("planning.csv");
    let inputs = vec![(SourceKind::Planning, planning.clone())];

    std::fs::write(&planning, LINKED).expect("write");
    let first_log = dir.path().join("event_log_1.csv");
    let first_map = dir.path().join("uuid_map_1.csv");
    create_event_log(&inputs, None, &first_log, day(2020, 5, 1)).expect("event log");
    let first = create_uuid_map(&first_log, None, &parcels, &first_map).expect("uuid map");
    assert_eq!(first.assignment.components, 1);
    let before = uuids_by_fk(&first_map);
    assert_eq!(before["planning_2016-001PRJ"], before["planning_2017-002ENV"]);

    std::fs::write(&planning, LINKED.replace(",2016-001PRJ\n", ",\n")).expect("write");
    let second_log = dir.path().join("event_log_2.csv");
    let second_map = dir.path().join("uuid_map_2.csv");
    let diffed = create_event_log(&inputs, Some(&first_log), &second_log, day(2020, 6, 1)).expect("diff");
    assert_eq!(diffed.rows_written, 1);
    assert!(std::fs::read_to_string(&second_log)
        .expect("read")
        .contains("planning_2017-002ENV,planning,2020-06-01,parent,\n"));

    let second = create_uuid_map(&second_log, Some(&first_map), &parcels, &second_map).expect("uuid map");
    assert_eq!(second.assignment.components, 2);
    assert_eq!(second.assignment.minted, 1);
    let after = uuids_by_fk(&second_map);
    assert_eq!(after["planning_2016-001PRJ"], before["planning_2016-001PRJ"]);
    assert_ne!(after["planning_2017-002ENV"], before["planning_2016-001PRJ"]);
}
