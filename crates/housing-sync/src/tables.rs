//! Flat output tables derived from assembled projects.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use housing_core::SourceKind;
use tracing::{debug, info};
use uuid::Uuid;

use crate::project::{Predicate, Project};

pub type Row = Vec<String>;

const NAME_VALUE_HEADER: &[&str] = &["id", "name", "value", "data_source"];

/// Projects that produced a `project_facts` row. Only these appear in the
/// remaining tables.
#[derive(Debug, Clone, Default)]
pub struct SeenProjects {
    ids: HashSet<Uuid>,
}

impl SeenProjects {
    pub fn insert(&mut self, uuid: Uuid) -> bool {
        self.ids.insert(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.ids.contains(uuid)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub trait TableGenerator {
    fn name(&self) -> &'static str;
    fn header(&self) -> &'static [&'static str];
    /// Pure read of `project`; may return no rows.
    fn rows(&self, project: &Project) -> Vec<Row>;
}

fn parse_count(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

fn nv_row(project: &Project, name: &str, value: impl Into<String>, source: &str) -> Row {
    vec![project.uuid.to_string(), name.to_string(), value.into(), source.to_string()]
}

/// Net and affordable unit counts from the first of `sources` reporting
/// either number; a missing half counts as zero.
fn mohcd_units(project: &Project, sources: &[SourceKind]) -> Option<(i64, i64, SourceKind)> {
    sources.iter().find_map(|&source| {
        let net = parse_count(&project.field("total_project_units", source, None));
        let bmr = parse_count(&project.field("total_affordable_units", source, None));
        (net.is_some() || bmr.is_some()).then(|| (net.unwrap_or(0), bmr.unwrap_or(0), source))
    })
}

fn new_construction() -> Predicate {
    Predicate::new().one_of("permit_type", ["1", "2", "3"])
}

/// Net new units from building permits, counted only from new-construction
/// permit types and only when a non-zero proposed count exists.
fn dbi_units(project: &Project) -> Option<i64> {
    let predicate = new_construction();
    let existing = parse_count(&project.field("existing_units", SourceKind::Pts, Some(&predicate))).unwrap_or(0);
    let proposed = parse_count(&project.field("proposed_units", SourceKind::Pts, Some(&predicate))).unwrap_or(0);
    (proposed != 0).then_some(proposed - existing)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectFacts;

impl TableGenerator for ProjectFacts {
    fn name(&self) -> &'static str {
        "project_facts"
    }

    fn header(&self) -> &'static [&'static str] {
        &[
            "id",
            "address",
            "applicant",
            "supervisor_district",
            "permit_authority",
            "permit_authority_id",
            "net_num_units",
            "net_num_units_data",
            "net_num_units_bmr",
            "net_num_units_bmr_data",
        ]
    }

    fn rows(&self, project: &Project) -> Vec<Row> {
        let planning = SourceKind::Planning;
        let mut row = vec![String::new(); self.header().len()];
        row[0] = project.uuid.to_string();

        let address = project.field("address", planning, None);
        if !address.is_empty() {
            row[1] = address;
            row[4] = planning.output_name().to_string();
            row[5] = project.field("record_id", planning, None);
        }

        match mohcd_units(project, &[SourceKind::MohcdPipeline, SourceKind::MohcdInclusionary]) {
            Some((net, bmr, source)) => {
                row[6] = net.to_string();
                row[7] = source.output_name().to_string();
                row[8] = bmr.to_string();
                row[9] = source.output_name().to_string();
            }
            None => {
                match dbi_units(project) {
                    Some(net) => {
                        row[6] = net.to_string();
                        row[7] = SourceKind::Pts.output_name().to_string();
                    }
                    None => {
                        row[6] = project.field("market_rate_units_net", planning, None);
                        if !row[6].is_empty() {
                            row[7] = planning.output_name().to_string();
                        }
                    }
                }
                row[8] = project.field("affordable_units_net", planning, None);
                if !row[8].is_empty() {
                    row[9] = planning.output_name().to_string();
                }
            }
        }

        if row[6].is_empty() && row[8].is_empty() {
            return Vec::new();
        }
        vec![row]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectUnitCountsFull;

impl TableGenerator for ProjectUnitCountsFull {
    fn name(&self) -> &'static str {
        "project_unit_counts_full"
    }

    fn header(&self) -> &'static [&'static str] {
        NAME_VALUE_HEADER
    }

    fn rows(&self, project: &Project) -> Vec<Row> {
        let planning = SourceKind::Planning;
        let mut rows = Vec::new();
        let market = project.field("market_rate_units_net", planning, None);
        if !market.is_empty() {
            rows.push(nv_row(project, "net_num_units", market, planning.output_name()));
        }
        let affordable = project.field("affordable_units_net", planning, None);
        if !affordable.is_empty() {
            rows.push(nv_row(project, "net_num_units_bmr", affordable, planning.output_name()));
        }
        if let Some(net) = dbi_units(project) {
            rows.push(nv_row(project, "net_num_units", net.to_string(), SourceKind::Pts.output_name()));
        }
        for source in [SourceKind::MohcdPipeline, SourceKind::MohcdInclusionary] {
            if let Some((net, bmr, source)) = mohcd_units(project, &[source]) {
                rows.push(nv_row(project, "net_num_units", net.to_string(), source.output_name()));
                rows.push(nv_row(project, "net_num_units_bmr", bmr.to_string(), source.output_name()));
            }
        }
        rows
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectGeo;

impl TableGenerator for ProjectGeo {
    fn name(&self) -> &'static str {
        "project_geo"
    }

    fn header(&self) -> &'static [&'static str] {
        NAME_VALUE_HEADER
    }

    fn rows(&self, project: &Project) -> Vec<Row> {
        let geom = project.field("the_geom", SourceKind::Planning, None);
        if geom.is_empty() {
            return Vec::new();
        }
        vec![nv_row(project, "geom", geom, SourceKind::Planning.output_name())]
    }
}

const BEDROOM_FIELDS: &[&str] = &[
    "residential_units_adu_studio",
    "residential_units_adu_1br",
    "residential_units_adu_2br",
    "residential_units_adu_3br",
    "residential_units_studio",
    "residential_units_1br",
    "residential_units_2br",
    "residential_units_3br",
    "residential_units_micro",
    "residential_units_sro",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectDetails;

impl TableGenerator for ProjectDetails {
    fn name(&self) -> &'static str {
        "project_details"
    }

    fn header(&self) -> &'static [&'static str] {
        NAME_VALUE_HEADER
    }

    fn rows(&self, project: &Project) -> Vec<Row> {
        let planning = SourceKind::Planning;
        let data = planning.output_name();
        let mut rows = Vec::new();

        let sq_ft = project.field("residential_sq_ft_net", planning, None);
        if !sq_ft.is_empty() {
            rows.push(nv_row(project, "net_num_square_feet", sq_ft, data));
        }

        let mut bedrooms = 0;
        let mut is_adu = false;
        for field in BEDROOM_FIELDS {
            let Some(net) = parse_count(&project.field(&format!("{field}_net"), planning, None)) else {
                continue;
            };
            is_adu |= field.contains("_adu_");
            bedrooms += 1;
            rows.push(nv_row(project, field, net.to_string(), data));
        }
        if bedrooms > 0 {
            rows.push(nv_row(project, "is_adu", if is_adu { "TRUE" } else { "FALSE" }, data));
        }
        rows
    }
}

#[derive(Debug, Clone)]
pub struct TableOutput {
    pub name: &'static str,
    pub path: PathBuf,
    pub rows: usize,
}

fn write_table(path: &Path, header: &[&str], rows: &[Row]) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(file);
    writer
        .write_record(header)
        .with_context(|| format!("writing {}", path.display()))?;
    for row in rows {
        writer
            .write_record(row)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Write `project_facts.csv` and then every other table into `out_dir`,
/// restricting the later tables to projects that produced a facts row.
pub fn write_tables(out_dir: &Path, projects: &[Project]) -> anyhow::Result<(Vec<TableOutput>, SeenProjects)> {
    let facts = ProjectFacts;
    let mut seen = SeenProjects::default();
    let mut fact_rows = Vec::new();
    for project in projects {
        let rows = facts.rows(project);
        if !rows.is_empty() {
            seen.insert(project.uuid);
            fact_rows.extend(rows);
        }
    }

    let mut outputs = Vec::new();
    let path = out_dir.join(format!("{}.csv", facts.name()));
    write_table(&path, facts.header(), &fact_rows)?;
    info!(table = facts.name(), rows = fact_rows.len(), "wrote table");
    outputs.push(TableOutput {
        name: facts.name(),
        path,
        rows: fact_rows.len(),
    });

    let generators: [&dyn TableGenerator; 3] = [&ProjectUnitCountsFull, &ProjectGeo, &ProjectDetails];
    for generator in generators {
        let rows: Vec<Row> = projects
            .iter()
            .filter(|project| seen.contains(&project.uuid))
            .flat_map(|project| generator.rows(project))
            .collect();
        let path = out_dir.join(format!("{}.csv", generator.name()));
        write_table(&path, generator.header(), &rows)?;
        info!(table = generator.name(), rows = rows.len(), "wrote table");
        outputs.push(TableOutput {
            name: generator.name(),
            path,
            rows: rows.len(),
        });
    }
    debug!(seen = seen.len(), projects = projects.len(), "tables complete");
    Ok((outputs, seen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RecordGraph;
    use chrono::{NaiveDate, NaiveDateTime};
    use housing_core::{parse_timestamp, Entry};
    use tempfile::tempdir;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).expect("timestamp")
    }

    fn project(entries: Vec<(SourceKind, &str, Vec<(&str, &str)>)>) -> Project {
        let mut graph = RecordGraph::new();
        graph.add("planning_1", NaiveDate::from_ymd_opt(2018, 1, 1));
        let entries = entries
            .into_iter()
            .map(|(source, fk, values)| {
                if fk != "planning_1" {
                    graph.link("planning_1", fk);
                }
                Entry::with_values(
                    fk,
                    source,
                    values.into_iter().map(|(k, v)| (k, v, ts("2020-01-01"))),
                )
            })
            .collect();
        Project::assemble(Uuid::new_v4(), entries, &graph)
    }

    #[test]
    fn facts_prefer_mohcd_unit_counts() {
        let project = project(vec![
            (SourceKind::Planning, "planning_1", vec![("address", "1 MAIN ST"), ("record_id", "2016-001PRJ"), ("market_rate_units_net", "40")]),
            (SourceKind::MohcdPipeline, "mohcd_pipeline_1", vec![("total_affordable_units", "12")]),
        ]);
        let rows = ProjectFacts.rows(&project);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row[1], "1 MAIN ST");
        assert_eq!(row[4], "planning");
        assert_eq!(row[5], "2016-001PRJ");
        assert_eq!(&row[6..], &["0", "mohcd_pipeline", "12", "mohcd_pipeline"]);
    }

    #[test]
    fn facts_fall_back_to_new_construction_permits_then_planning() {
        let permits = project(vec![
            (SourceKind::Planning, "planning_1", vec![("affordable_units_net", "3")]),
            (SourceKind::Pts, "pts_1", vec![("permit_type", "1"), ("existing_units", "2"), ("proposed_units", "10")]),
            (SourceKind::Pts, "pts_2", vec![("permit_type", "8"), ("proposed_units", "99")]),
        ]);
        let row = &ProjectFacts.rows(&permits)[0];
        assert_eq!(&row[6..], &["8", "dbi", "3", "planning"]);

        let planning_only = project(vec![(SourceKind::Planning, "planning_1", vec![("market_rate_units_net", "7")])]);
        let row = &ProjectFacts.rows(&planning_only)[0];
        assert_eq!(&row[6..], &["7", "planning", "", ""]);

        let nothing = project(vec![(SourceKind::Planning, "planning_1", vec![("address", "1 MAIN ST")])]);
        assert!(ProjectFacts.rows(&nothing).is_empty());
    }

    #[test]
    fn details_report_bedrooms_and_adu_flag() {
        let project = project(vec![(
            SourceKind::Planning,
            "planning_1",
            vec![
                ("residential_sq_ft_net", "1200"),
                ("residential_units_adu_1br_net", "1"),
                ("residential_units_2br_net", "4"),
                ("residential_units_3br_net", "n/a"),
            ],
        )]);
        let rows = ProjectDetails.rows(&project);
        let names: Vec<_> = rows.iter().map(|row| (row[1].as_str(), row[2].as_str())).collect();
        assert_eq!(
            names,
            vec![
                ("net_num_square_feet", "1200"),
                ("residential_units_adu_1br", "1"),
                ("residential_units_2br", "4"),
                ("is_adu", "TRUE"),
            ]
        );
    }

    #[test]
    fn later_tables_only_cover_projects_with_facts() {
        let dir = tempdir().expect("tempdir");
        let counted = project(vec![(
            SourceKind::Planning,
            "planning_1",
            vec![("market_rate_units_net", "5"), ("the_geom", "POINT (1 2)")],
        )]);
        let uncounted = project(vec![(SourceKind::Planning, "planning_1", vec![("the_geom", "POINT (3 4)")])]);

        let (outputs, seen) = write_tables(dir.path(), &[counted.clone(), uncounted]).expect("tables");
        assert_eq!(seen.len(), 1);
        assert!(seen.contains(&counted.uuid));

        let rows: Vec<_> = outputs.iter().map(|o| (o.name, o.rows)).collect();
        assert_eq!(
            rows,
            vec![
                ("project_facts", 1),
                ("project_unit_counts_full", 1),
                ("project_geo", 1),
                ("project_details", 0),
            ]
        );
        let geo = std::fs::read_to_string(dir.path().join("project_geo.csv")).expect("geo");
        assert_eq!(geo, format!("id,name,value,data_source\n{},geom,POINT (1 2),planning\n", counted.uuid));
    }
}
