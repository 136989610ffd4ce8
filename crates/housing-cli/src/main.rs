use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use housing_adapters::ParcelIndex;
use housing_core::SourceKind;
use housing_storage::{HttpFetcher, SourceFileStore};
use housing_sync::{PipelineConfig, RelationalOptions, SourceRegistry};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "housing-cli")]
#[command(about = "Housing project identity pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Decode source files into an event log, optionally as a diff on a prior log.
    EventLog {
        /// `kind=path`, e.g. `planning=planning.csv`; repeatable.
        #[arg(long = "source", value_parser = parse_source_arg, required = true)]
        sources: Vec<(SourceKind, PathBuf)>,
        #[arg(long)]
        diff: Option<PathBuf>,
        /// Date stamped on written rows (defaults to today).
        #[arg(long = "the-date")]
        the_date: Option<NaiveDate>,
        out: PathBuf,
    },
    /// Link event log records and assign project uuids.
    UuidMap {
        event_log: PathBuf,
        /// Previous uuid map whose identifiers are carried over.
        #[arg(long = "uuid-map")]
        uuid_map: Option<PathBuf>,
        #[arg(long)]
        parcels: Option<PathBuf>,
        out: PathBuf,
    },
    /// Build projects and write the relational tables.
    Relational {
        #[arg(long = "event-log")]
        event_log: PathBuf,
        #[arg(long = "uuid-map")]
        uuid_map: PathBuf,
        #[arg(long)]
        parcels: Option<PathBuf>,
        #[arg(long = "out-dir")]
        out_dir: PathBuf,
        /// Freshness cutoff (defaults to today).
        #[arg(long = "as-of")]
        as_of: Option<NaiveDate>,
        /// Keep projects that have no planning record at their root.
        #[arg(long)]
        keep_unrooted: bool,
    },
    /// Download every enabled source in the registry.
    Fetch {
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

fn parse_source_arg(raw: &str) -> Result<(SourceKind, PathBuf), String> {
    let (kind, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected kind=path, got `{raw}`"))?;
    let kind = SourceKind::from_name(kind.trim()).ok_or_else(|| {
        let known: Vec<&str> = SourceKind::ALL.iter().map(|k| k.name()).collect();
        format!("unknown source `{kind}` (known: {})", known.join(", "))
    })?;
    if path.trim().is_empty() {
        return Err(format!("missing path for source `{kind}`"));
    }
    Ok((kind, PathBuf::from(path.trim())))
}

fn load_parcels(path: Option<&Path>) -> Result<ParcelIndex> {
    match path {
        Some(path) => ParcelIndex::from_path(path).with_context(|| format!("loading parcels {}", path.display())),
        None => Ok(ParcelIndex::default()),
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::EventLog {
            sources,
            diff,
            the_date,
            out,
        } => {
            let summary =
                housing_sync::create_event_log(&sources, diff.as_deref(), &out, the_date.unwrap_or_else(today))?;
            println!(
                "event log complete: path={} records={} rows_written={}",
                out.display(),
                summary.records,
                summary.rows_written
            );
        }
        Commands::UuidMap {
            event_log,
            uuid_map,
            parcels,
            out,
        } => {
            let parcels = load_parcels(parcels.as_deref())?;
            let summary = housing_sync::create_uuid_map(&event_log, uuid_map.as_deref(), &parcels, &out)?;
            println!(
                "uuid map complete: path={} records={} components={} minted={} adopted={}",
                out.display(),
                summary.records,
                summary.assignment.components,
                summary.assignment.minted,
                summary.assignment.adopted
            );
        }
        Commands::Relational {
            event_log,
            uuid_map,
            parcels,
            out_dir,
            as_of,
            keep_unrooted,
        } => {
            let parcels = load_parcels(parcels.as_deref())?;
            let options = RelationalOptions {
                require_planning_root: config.require_planning_root && !keep_unrooted,
                as_of: as_of.unwrap_or_else(today),
            };
            let summary = housing_sync::process_event_log(&event_log, &uuid_map, &parcels, &out_dir, &options)?;
            println!(
                "relational complete: projects={} skipped={} manifest={}",
                summary.projects,
                summary.skipped_projects,
                summary.manifest_path.display()
            );
            for table in &summary.tables {
                println!("  {} rows={} path={}", table.name, table.rows, table.path.display());
            }
        }
        Commands::Fetch { sources, dest } => {
            let registry_path = sources.unwrap_or_else(|| config.registry_path.clone());
            let registry = SourceRegistry::load(&registry_path)?;
            info!(registry = %registry_path.display(), sources = registry.sources.len(), "loaded source registry");
            let store = SourceFileStore::new(dest.unwrap_or_else(|| config.downloads_dir()));
            let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
            let downloaded =
                housing_sync::download_sources(&registry, &store, fetcher, &config.workdir, today()).await?;
            println!("fetch complete: sources={} dest={}", downloaded.len(), store.root().display());
            for (source, saved) in &downloaded {
                println!(
                    "  {source}={} sha256={} reused={}",
                    saved.path.display(),
                    saved.content_hash,
                    saved.reused
                );
            }
        }
    }

    Ok(())
}
