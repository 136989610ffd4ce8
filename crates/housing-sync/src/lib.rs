//! Pipeline orchestration: event log, uuid map and relational stages plus
//! source downloads.

pub mod freshness;
pub mod graph;
pub mod linkage;
pub mod project;
pub mod tables;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use housing_adapters::{adapter_for_source, ParcelIndex};
use housing_core::{Entry, SourceKind, SourceRecord};
use housing_storage::{
    fk_to_uuid, read_facts, read_uuid_map, write_diff, write_dump, write_uuid_map, DiffSummary,
    DownloadedSource, HttpClientConfig, HttpFetcher, Snapshot, SourceFileStore,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use freshness::Freshness;
pub use graph::{AssignmentReport, RecordGraph, RecordNode};
pub use linkage::{reference_date, RecordGraphBuilder};
pub use project::{Matcher, Predicate, Project};
pub use tables::{write_tables, SeenProjects, TableGenerator, TableOutput};

pub const CRATE_NAME: &str = "housing-sync";

const SKIPPED_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: SourceKind,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    /// Local file used instead of downloading `url`.
    #[serde(default)]
    pub manual_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workdir: PathBuf,
    pub registry_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub download_concurrency: usize,
    pub require_planning_root: bool,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            workdir: std::env::var("HOUSING_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./work")),
            registry_path: std::env::var("HOUSING_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("HOUSING_USER_AGENT")
                .unwrap_or_else(|_| "housing-pipeline/0.1".to_string()),
            http_timeout_secs: std::env::var("HOUSING_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            download_concurrency: std::env::var("HOUSING_DOWNLOAD_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            require_planning_root: std::env::var("HOUSING_REQUIRE_PLANNING_ROOT")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.download_concurrency,
            ..Default::default()
        }
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.workdir.join("downloads")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogSummary {
    pub records: usize,
    pub by_source: Vec<(SourceKind, usize)>,
    /// Rows written by a full dump, or rows appended on top of the prior log.
    pub rows_written: usize,
    pub new_records: Option<usize>,
}

/// Decode every input file and write the event log to `out`, either as a
/// full dump or as a diff against `prior`.
pub fn create_event_log(
    inputs: &[(SourceKind, PathBuf)],
    prior: Option<&Path>,
    out: &Path,
    the_date: NaiveDate,
) -> Result<EventLogSummary> {
    let mut records: Vec<SourceRecord> = Vec::new();
    let mut by_source = Vec::new();
    for (source, path) in inputs {
        let adapter = adapter_for_source(*source);
        let decoded = adapter
            .read_records(path)
            .with_context(|| format!("reading {source} source {}", path.display()))?;
        info!(%source, path = %path.display(), records = decoded.len(), "decoded source");
        by_source.push((*source, decoded.len()));
        records.extend(decoded);
    }

    let summary = match prior {
        Some(prior) => {
            let DiffSummary {
                prior_records,
                new_records,
                appended_rows,
            } = write_diff(prior, out, &records, the_date)
                .with_context(|| format!("diffing {} into {}", prior.display(), out.display()))?;
            info!(prior_records, new_records, appended_rows, "appended event log diff");
            EventLogSummary {
                records: records.len(),
                by_source,
                rows_written: appended_rows,
                new_records: Some(new_records),
            }
        }
        None => {
            let rows = write_dump(out, &records, the_date)
                .with_context(|| format!("writing event log {}", out.display()))?;
            info!(rows, "wrote event log dump");
            EventLogSummary {
                records: records.len(),
                by_source,
                rows_written: rows,
                new_records: None,
            }
        }
    };
    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct UuidMapSummary {
    pub records: usize,
    pub prior_rows: usize,
    pub seeded: usize,
    pub assignment: AssignmentReport,
}

/// Link the latest snapshot of `event_log` into a record graph, carry over
/// `prior_map` uuids and write the updated map to `out`.
pub fn create_uuid_map(
    event_log: &Path,
    prior_map: Option<&Path>,
    parcels: &ParcelIndex,
    out: &Path,
) -> Result<UuidMapSummary> {
    let snapshot =
        Snapshot::read(event_log).with_context(|| format!("reading event log {}", event_log.display()))?;
    let prior = match prior_map {
        Some(path) => read_uuid_map(path).with_context(|| format!("reading uuid map {}", path.display()))?,
        None => Vec::new(),
    };

    let mut graph = RecordGraphBuilder::new(&snapshot, parcels).with_prior(&prior).build();
    let seeded = graph.iter().filter(|node| node.uuid.is_some()).count();
    let assignment = graph.assign_uuids();
    write_uuid_map(out, &graph.uuid_rows()).with_context(|| format!("writing uuid map {}", out.display()))?;
    info!(
        records = graph.len(),
        components = assignment.components,
        minted = assignment.minted,
        adopted = assignment.adopted,
        "wrote uuid map"
    );

    Ok(UuidMapSummary {
        records: graph.len(),
        prior_rows: prior.len(),
        seeded,
        assignment,
    })
}

#[derive(Debug, Clone)]
pub struct RelationalOptions {
    /// Drop projects without a planning root entry.
    pub require_planning_root: bool,
    /// Freshness dates after this day are treated as bad data.
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub generated_at: DateTime<Utc>,
    pub event_log: String,
    pub uuid_map: String,
    pub projects: usize,
    pub skipped_projects: usize,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone)]
pub struct RelationalSummary {
    pub facts: usize,
    pub projects: usize,
    pub skipped_projects: usize,
    pub unmapped_records: usize,
    pub tables: Vec<TableOutput>,
    pub seen_projects: usize,
    pub manifest_path: PathBuf,
}

/// Entries of one project, in the order their foreign keys first appear.
#[derive(Debug)]
struct ProjectEntries {
    uuid: Uuid,
    entries: Vec<Entry>,
    by_fk: HashMap<String, usize>,
}

impl ProjectEntries {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            entries: Vec::new(),
            by_fk: HashMap::new(),
        }
    }

    fn entry_mut(&mut self, fk: &str, source: SourceKind) -> &mut Entry {
        let index = match self.by_fk.get(fk) {
            Some(index) => *index,
            None => {
                self.entries.push(Entry::new(fk, source));
                self.by_fk.insert(fk.to_string(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        &mut self.entries[index]
    }
}

/// Replay the event log into projects and write the relational tables,
/// `data_freshness.csv` and `manifest.json` into `out_dir`.
pub fn process_event_log(
    event_log: &Path,
    uuid_map: &Path,
    parcels: &ParcelIndex,
    out_dir: &Path,
    options: &RelationalOptions,
) -> Result<RelationalSummary> {
    let uuid_rows =
        read_uuid_map(uuid_map).with_context(|| format!("reading uuid map {}", uuid_map.display()))?;
    let uuid_lookup = fk_to_uuid(&uuid_rows);
    let facts = read_facts(event_log).with_context(|| format!("reading event log {}", event_log.display()))?;

    let mut freshness = Freshness::new(options.as_of);
    let mut grouped: Vec<ProjectEntries> = Vec::new();
    let mut group_index: HashMap<Uuid, usize> = HashMap::new();
    let mut unmapped: HashSet<&str> = HashSet::new();
    for fact in &facts {
        freshness.update(fact);
        let Some(uuid) = uuid_lookup.get(&fact.fk) else {
            if unmapped.insert(fact.fk.as_str()) {
                warn!(fk = %fact.fk, source = %fact.source, "record has no uuid; skipping");
            }
            continue;
        };
        let index = *group_index.entry(*uuid).or_insert_with(|| {
            grouped.push(ProjectEntries::new(*uuid));
            grouped.len() - 1
        });
        grouped[index].entry_mut(&fact.fk, fact.source).add_fact(fact);
    }

    let snapshot = Snapshot::from_facts(&facts);
    let graph = RecordGraphBuilder::new(&snapshot, parcels).build();

    let mut projects = Vec::with_capacity(grouped.len());
    let mut skipped = 0usize;
    for group in grouped {
        let project = Project::assemble(group.uuid, group.entries, &graph);
        if options.require_planning_root && !project.has_authoritative_root() {
            if skipped < SKIPPED_SAMPLE_LIMIT {
                debug!(
                    uuid = %project.uuid,
                    fk = project.any_root_fk().unwrap_or_default(),
                    "project has no planning root; skipping"
                );
            }
            skipped += 1;
            continue;
        }
        projects.push(project);
    }
    if skipped > 0 {
        warn!(skipped, "skipped projects without a planning root");
    }

    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let (tables, seen) = write_tables(out_dir, &projects)?;

    let freshness_path = out_dir.join("data_freshness.csv");
    freshness.write_csv(&freshness_path)?;
    freshness.log_bad_dates();

    let mut files = Vec::with_capacity(tables.len() + 1);
    for table in &tables {
        files.push(manifest_entry(table.name, out_dir, &table.path)?);
    }
    files.push(manifest_entry("data_freshness", out_dir, &freshness_path)?);

    let manifest = RunManifest {
        generated_at: Utc::now(),
        event_log: event_log.display().to_string(),
        uuid_map: uuid_map.display().to_string(),
        projects: projects.len(),
        skipped_projects: skipped,
        files,
    };
    let manifest_path = out_dir.join("manifest.json");
    std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(
        projects = projects.len(),
        skipped,
        seen = seen.len(),
        manifest = %manifest_path.display(),
        "relational tables complete"
    );

    Ok(RelationalSummary {
        facts: facts.len(),
        projects: projects.len(),
        skipped_projects: skipped,
        unmapped_records: unmapped.len(),
        tables,
        seen_projects: seen.len(),
        manifest_path,
    })
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Fetch every enabled registry source into `store`, returned in registry
/// order. Manual files are copied without touching the network. The first
/// failure aborts the remaining downloads.
pub async fn download_sources(
    registry: &SourceRegistry,
    store: &SourceFileStore,
    fetcher: Arc<HttpFetcher>,
    workdir: &Path,
    downloaded_on: NaiveDate,
) -> Result<Vec<(SourceKind, DownloadedSource)>> {
    let run_id = Uuid::new_v4();
    info!(%run_id, sources = registry.enabled().count(), "starting downloads");

    let mut tasks = JoinSet::new();
    for (index, config) in registry.enabled().enumerate() {
        let source = config.source;
        let store = store.clone();
        if let Some(manual) = &config.manual_path {
            let path = workdir.join(manual);
            tasks.spawn(async move {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading manual file {} for {source}", path.display()))?;
                let saved = store.save(downloaded_on, source.name(), &bytes).await?;
                Ok::<_, anyhow::Error>((index, source, saved))
            });
            continue;
        }

        let Some(url) = config.url.clone() else {
            anyhow::bail!("source {source} is enabled but has neither a url nor a manual_path");
        };
        let fetcher = Arc::clone(&fetcher);
        tasks.spawn(async move {
            let body = fetcher
                .fetch_bytes(run_id, source.name(), &url)
                .await
                .with_context(|| format!("downloading {source}"))?;
            let saved = store
                .save(downloaded_on, source.name(), &body)
                .await
                .with_context(|| format!("saving {source}"))?;
            Ok((index, source, saved))
        });
    }

    let mut downloaded = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (index, source, saved) = joined.context("download task panicked")??;
        info!(
            %source,
            path = %saved.path.display(),
            bytes = saved.byte_size,
            reused = saved.reused,
            "source ready"
        );
        downloaded.push((index, source, saved));
    }
    downloaded.sort_by_key(|(index, _, _)| *index);
    Ok(downloaded
        .into_iter()
        .map(|(_, source, saved)| (source, saved))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use housing_storage::BackoffPolicy;
    use tempfile::tempdir;

    const REGISTRY: &str = r#"
sources:
  - source: planning
    display_name: Planning records
    url: https://example.invalid/planning.csv
  - source: bmr
    display_name: Affordable rental portfolio
    enabled: false
  - source: permit_addenda_summary
    display_name: Permit addenda
    manual_path: addenda.csv
"#;

    #[test]
    fn registry_parses_kinds_and_defaults() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).expect("registry");
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.sources[1].source, SourceKind::AffordableRental);
        let enabled: Vec<_> = registry.enabled().map(|s| s.source).collect();
        assert_eq!(enabled, vec![SourceKind::Planning, SourceKind::PermitAddendaSummary]);
        assert_eq!(registry.sources[2].manual_path.as_deref(), Some(Path::new("addenda.csv")));
    }

    #[test]
    fn registry_rejects_unknown_sources() {
        let err = SourceRegistry::from_yaml_str("sources:\n  - source: zoning\n    display_name: x\n");
        assert!(err.is_err());
    }

    #[test]
    fn http_config_carries_pipeline_settings() {
        let config = PipelineConfig {
            workdir: PathBuf::from("/tmp/work"),
            registry_path: PathBuf::from("sources.yaml"),
            user_agent: "agent/1".to_string(),
            http_timeout_secs: 7,
            download_concurrency: 2,
            require_planning_root: true,
        };
        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(7));
        assert_eq!(http.user_agent.as_deref(), Some("agent/1"));
        assert_eq!(http.global_concurrency, 2);
        assert_eq!(config.downloads_dir(), PathBuf::from("/tmp/work/downloads"));
    }

    fn offline_fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_millis(200),
                backoff: BackoffPolicy {
                    max_retries: 0,
                    ..BackoffPolicy::default()
                },
                ..Default::default()
            })
            .expect("fetcher"),
        )
    }

    #[tokio::test]
    async fn manual_sources_skip_the_network() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("addenda.csv"), "APPLICATION_NUMBER,ARRIVE\n1,2020/01/02\n").expect("write");
        let registry = SourceRegistry::from_yaml_str(
            "sources:\n  - source: permit_addenda_summary\n    display_name: Permit addenda\n    manual_path: addenda.csv\n",
        )
        .expect("registry");
        let store = SourceFileStore::new(dir.path().join("downloads"));
        let day = NaiveDate::from_ymd_opt(2020, 6, 1).expect("date");

        let downloaded = download_sources(&registry, &store, offline_fetcher(), dir.path(), day)
            .await
            .expect("downloads");

        assert_eq!(downloaded.len(), 1);
        let (source, saved) = &downloaded[0];
        assert_eq!(*source, SourceKind::PermitAddendaSummary);
        assert!(saved.path.starts_with(dir.path().join("downloads/2020-06-01/permit_addenda_summary")));
        assert!(saved.path.exists());
    }

    #[tokio::test]
    async fn a_source_without_url_or_file_aborts_naming_it() {
        let dir = tempdir().expect("tempdir");
        let registry =
            SourceRegistry::from_yaml_str("sources:\n  - source: tco\n    display_name: Certificates\n").expect("registry");
        let store = SourceFileStore::new(dir.path());
        let day = NaiveDate::from_ymd_opt(2020, 6, 1).expect("date");

        let err = download_sources(&registry, &store, offline_fetcher(), dir.path(), day)
            .await
            .expect_err("no url");
        assert!(err.to_string().contains("tco"));
    }

    #[tokio::test]
    async fn a_missing_manual_file_aborts_naming_the_source() {
        let dir = tempdir().expect("tempdir");
        let registry = SourceRegistry::from_yaml_str(
            "sources:\n  - source: pts\n    display_name: Permits\n    manual_path: missing.csv\n",
        )
        .expect("registry");
        let store = SourceFileStore::new(dir.path());
        let day = NaiveDate::from_ymd_opt(2020, 6, 1).expect("date");

        let err = download_sources(&registry, &store, offline_fetcher(), dir.path(), day)
            .await
            .expect_err("missing");
        assert!(format!("{err:#}").contains("pts"));
    }
}
