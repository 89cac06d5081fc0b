use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Args, Parser, Subcommand};
use roster_core::{EventType, JobStatus};
use roster_storage::{MemoryRosterStore, PgRosterStore, RosterStore};
use roster_sync::{
    new_job_id, DatasetRegistry, SyncConfig, SyncPipeline, SyncRequest, SyncRunSummary,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Membership roster sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch a membership export and sync it into the active event's roster.
    Sync(SyncArgs),
    /// Apply pending database migrations.
    Migrate,
    /// List the datasets declared in datasets.yaml.
    Datasets,
    /// Print the stored progress record of a sync job.
    Job { job_id: String },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["dataset", "url"])))]
struct SyncArgs {
    /// Dataset id from datasets.yaml.
    #[arg(long)]
    dataset: Option<String>,
    /// Export URL for an ad-hoc sync.
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    job_id: Option<String>,
    /// Overrides the dataset's (or the default) event type.
    #[arg(long)]
    event_type: Option<EventType>,
    /// Sync into an in-memory store; nothing is written to the database.
    #[arg(long)]
    dry_run: bool,
    /// Read the export body from a file instead of fetching it.
    #[arg(long)]
    file: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => sync(args).await,
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Datasets => {
            let config = SyncConfig::from_env()?;
            let registry = DatasetRegistry::load(&config.registry_path())?;
            for dataset in &registry.datasets {
                println!(
                    "{}\t{}\t{}\t{}",
                    dataset.dataset_id,
                    if dataset.enabled { "enabled" } else { "disabled" },
                    dataset.event_type.unwrap_or(config.default_event_type),
                    dataset.display_name
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Job { job_id } => {
            let config = SyncConfig::from_env()?;
            let store = connect(&config).await?;
            let Some(progress) = store.load_job_progress(&job_id).await? else {
                bail!("no sync job with id {job_id}");
            };
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect(config: &SyncConfig) -> Result<PgRosterStore> {
    PgRosterStore::connect(&config.database_url, config.max_db_connections)
        .await
        .context("connecting to DATABASE_URL")
}

async fn sync(args: SyncArgs) -> Result<ExitCode> {
    let config = SyncConfig::from_env()?;
    let job_id = args.job_id.clone().unwrap_or_else(|| new_job_id(Utc::now()));

    let mut request = match (&args.dataset, &args.url) {
        (Some(dataset_id), _) => {
            let registry = DatasetRegistry::load(&config.registry_path())?;
            let dataset = registry
                .get(dataset_id)
                .with_context(|| format!("unknown dataset {dataset_id}"))?;
            if !dataset.enabled {
                bail!("dataset {dataset_id} is disabled");
            }
            // A local file never needs the credentials embedded in the URL.
            let url = if args.file.is_some() {
                dataset.url.clone()
            } else {
                dataset.resolved_url()?
            };
            SyncRequest::for_dataset(dataset, url, job_id, &config)
        }
        (None, Some(url)) => SyncRequest::for_url(url.clone(), job_id, &config),
        (None, None) => bail!("either --dataset or --url is required"),
    };
    if let Some(event_type) = args.event_type {
        request.event_type = event_type;
    }

    let body = match &args.file {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };

    let summary = if args.dry_run {
        info!("dry run: syncing into an in-memory store");
        let pipeline = SyncPipeline::new(config, MemoryRosterStore::new())?;
        execute(&pipeline, &request, body.as_deref()).await?
    } else {
        let store = connect(&config).await?;
        let pipeline = SyncPipeline::new(config, store)?;
        execute(&pipeline, &request, body.as_deref()).await?
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(match summary.status {
        JobStatus::Success => ExitCode::SUCCESS,
        JobStatus::Partial => ExitCode::from(2),
        JobStatus::Failed | JobStatus::Running => ExitCode::FAILURE,
    })
}

async fn execute<S: RosterStore>(
    pipeline: &SyncPipeline<S>,
    request: &SyncRequest,
    body: Option<&str>,
) -> Result<SyncRunSummary> {
    let result = match body {
        Some(text) => pipeline.run_with_text(request, text).await,
        None => pipeline.run(request).await,
    };
    result.with_context(|| format!("sync job {} failed", request.job_id))
}
