use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use orgwatch_adapters::{load_json_file_source, RecordSource};
use orgwatch_storage::{LedgerStore, MemoryLedgerStore};
use orgwatch_sync::{IngestPipeline, RunError, TrackerConfig};
use orgwatch_web::AppState;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "orgwatch")]
#[command(about = "Organization change tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull every page from the source, version what changed, sweep the rest.
    Ingest {
        /// JSON file of records instead of ORGWATCH_SOURCE_URL.
        #[arg(long)]
        file: Option<PathBuf>,
        /// JSON pointer to the record array inside the file.
        #[arg(long)]
        pointer: Option<String>,
        /// Ingest into an in-memory ledger and discard it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Mark entities not seen since the given RFC 3339 instant inactive.
    Cleanup {
        #[arg(long)]
        since: DateTime<Utc>,
    },
    Serve,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ORGWATCH_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = TrackerConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest {
        file: None,
        pointer: None,
        dry_run: false,
    }) {
        Commands::Ingest {
            file,
            pointer,
            dry_run,
        } => {
            let mut source = open_source(&config, file, pointer).await?;
            let store: Arc<dyn LedgerStore> = if dry_run {
                Arc::new(MemoryLedgerStore::new())
            } else {
                Arc::new(config.connect_store().await?)
            };
            let pipeline =
                IngestPipeline::new(store, config.insight_generator()?, config.ingest_settings());

            let summary = match pipeline.run(source.as_mut()).await {
                Ok(summary) => summary,
                Err(err) => {
                    let stats = err.stats();
                    eprintln!(
                        "run aborted: total={} new={} updated={} unchanged={} failed={}",
                        stats.total, stats.new, stats.updated, stats.unchanged, stats.failed
                    );
                    if matches!(err, RunError::StoreUnavailable { .. }) {
                        eprintln!("lost the store connection; check DATABASE_URL");
                    }
                    return Err(anyhow::Error::new(err).context("ingest run failed"));
                }
            };
            let run = &summary.run;
            println!(
                "ingest {}: run_id={} total={} new={} updated={} unchanged={} failed={} deactivated={} avg_ms={:.1}",
                run.status.as_str(),
                run.run_id,
                run.stats.total,
                run.stats.new,
                run.stats.updated,
                run.stats.unchanged,
                run.stats.failed,
                run.deactivated,
                run.stats.avg_ms()
            );
            if let Some(reason) = summary.source_error {
                eprintln!("source stopped early: {reason}");
            }
        }
        Commands::Migrate => {
            let store = config.connect_store().await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Cleanup { since } => {
            let store = config.connect_store().await?;
            let pipeline = IngestPipeline::new(
                Arc::new(store),
                config.insight_generator()?,
                config.ingest_settings(),
            );
            let deactivated = pipeline.run_cleanup(since).await?;
            println!("cleanup complete: deactivated={deactivated}");
        }
        Commands::Serve => {
            let store = config.connect_store().await?;
            let state = AppState::new(Arc::new(store), config.insight_generator()?)
                .with_insight_timeout(config.insight_timeout());
            orgwatch_web::serve(state, config.web_port).await?;
        }
    }

    Ok(())
}

async fn open_source(
    config: &TrackerConfig,
    file: Option<PathBuf>,
    pointer: Option<String>,
) -> Result<Box<dyn RecordSource>> {
    if let Some(path) = file {
        let pointer = pointer.or_else(|| config.source_records_pointer.clone());
        let source = load_json_file_source(&path, pointer.as_deref(), config.page_size)
            .await
            .with_context(|| format!("loading records from {}", path.display()))?;
        return Ok(Box::new(source));
    }
    match config.http_source()? {
        Some(source) => Ok(Box::new(source)),
        None => bail!("no record source: pass --file or set ORGWATCH_SOURCE_URL"),
    }
}
