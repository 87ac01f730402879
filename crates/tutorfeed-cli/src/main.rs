use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tutorfeed_extract::OpenAiCompatClient;
use tutorfeed_pipeline::{
    parse_jsonl, triage_report, Ingestor, Maintenance, PipelineConfig, Stores, Worker,
};
use tutorfeed_signals::Taxonomy;
use tutorfeed_storage::{PgStore, PgStoreOptions};

#[derive(Debug, Parser)]
#[command(name = "tutorfeed")]
#[command(about = "Tutoring assignment extraction pipeline")]
struct Cli {
    /// YAML file overlaid on the defaults; environment variables still win.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the worker until interrupted.
    Work {
        /// Do not schedule maintenance sweeps in this process.
        #[arg(long)]
        no_sweep: bool,
    },
    /// Claim and process a single batch.
    Once,
    /// Store messages from a JSONL file and enqueue extraction.
    Ingest { path: PathBuf },
    /// Enqueue stored messages that have no job for the current pipeline version.
    Backfill {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },
    /// Reclaim stale jobs and expire assignments nobody re-posted.
    Sweep,
    /// Print the triage report as markdown.
    Triage {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tutorfeed=info")),
        )
        .init();
}

async fn connect(config: &PipelineConfig) -> Result<Arc<PgStore>> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let store = PgStore::connect(url, &PgStoreOptions::default(), config.queue_settings())
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn load_taxonomy(config: &PipelineConfig) -> Result<Arc<Taxonomy>> {
    let taxonomy = match &config.taxonomy_path {
        Some(path) => Taxonomy::load(path)?,
        None => Taxonomy::embedded()?,
    };
    info!(version = taxonomy.version(), "subject taxonomy loaded");
    Ok(Arc::new(taxonomy))
}

fn build_worker(config: &PipelineConfig, store: Arc<PgStore>) -> Result<Worker> {
    let backend = Arc::new(OpenAiCompatClient::new(config.llm_client_config())?);
    Worker::new(
        config.clone(),
        Stores::from_shared(store),
        backend,
        load_taxonomy(config)?,
    )
}

fn maintenance(config: &PipelineConfig, store: &Arc<PgStore>) -> Maintenance {
    Maintenance::new(
        store.clone(),
        store.clone(),
        config.stale_after(),
        config.assignment_expiry(),
    )
}

async fn work(config: PipelineConfig, no_sweep: bool) -> Result<()> {
    let store = connect(&config).await?;
    let worker = build_worker(&config, store.clone())?;

    let mut scheduler = if no_sweep {
        None
    } else {
        let sched = Arc::new(maintenance(&config, &store))
            .build_scheduler(&config.sweep_cron)
            .await?;
        sched.start().await.context("starting maintenance scheduler")?;
        Some(sched)
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(err) => warn!(error = %err, "failed to listen for interrupt, shutting down"),
        }
        on_signal.cancel();
    });

    let total = worker.run(shutdown).await?;
    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping maintenance scheduler")?;
    }
    println!("{}", serde_json::to_string_pretty(&total)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Work { no_sweep: false }) {
        Commands::Work { no_sweep } => work(config, no_sweep).await?,
        Commands::Once => {
            let store = connect(&config).await?;
            let summary = build_worker(&config, store)?.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Ingest { path } => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let messages = parse_jsonl(&text).with_context(|| format!("parsing {}", path.display()))?;
            let store = connect(&config).await?;
            let summary = Ingestor::new(store.clone(), store).ingest_all(&messages).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Backfill { hours, limit } => {
            let store = connect(&config).await?;
            let since = Utc::now() - Duration::hours(hours);
            let enqueued = Ingestor::new(store.clone(), store).backfill(since, limit).await?;
            println!("backfill complete: enqueued={enqueued} since={since}");
        }
        Commands::Sweep => {
            let store = connect(&config).await?;
            let report = maintenance(&config, &store).sweep().await?;
            println!(
                "sweep complete: requeued={} expired={}",
                report.requeued, report.expired
            );
        }
        Commands::Triage { limit } => {
            let store = connect(&config).await?;
            let report = triage_report(store.as_ref(), &config.pipeline_version, limit).await?;
            println!("{report}");
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
