use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use paper_pipeline::{
    export_day, load_config, AppConfig, ArxivFetcher, GeminiOracle, Generator, ItemStore, JsonlHandoff, LogGenerator,
    Orchestrator, RunState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "paper-pipeline")]
#[command(about = "Daily paper ranking pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pipeline.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, screen, select and dispatch one day bucket
    Run {
        /// Day bucket (YYYY-MM-DD), defaults to today in UTC
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Log dispatches instead of writing the hand-off queue
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the persisted run state and failures for a day
    Status {
        #[arg(long)]
        date: NaiveDate,
    },

    /// Write the day's JSON artifacts and markdown summary
    Export {
        #[arg(long)]
        date: NaiveDate,

        /// Output directory, defaults to storage.output_dir
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Arc::new(ItemStore::open(&config.storage.database_url).await?);

    let outcome = match cli.command {
        Commands::Run { date, dry_run } => run_command(&config, store.clone(), date, dry_run).await,
        Commands::Status { date } => status_command(&store, date).await,
        Commands::Export { date, out } => {
            let dir = out.unwrap_or_else(|| config.storage.output_dir.clone());
            let files = export_day(&store, date, &dir).await?;
            info!("Wrote {}", files.summary.display());
            Ok(())
        }
    };

    store.close().await;
    outcome
}

async fn run_command(config: &AppConfig, store: Arc<ItemStore>, date: Option<NaiveDate>, dry_run: bool) -> Result<()> {
    let day = date.unwrap_or_else(|| Utc::now().date_naive());

    let catalog = Arc::new(ArxivFetcher::new(config.catalog.clone())?);
    let oracle = Arc::new(GeminiOracle::from_env(config.oracle.clone(), config.pipeline.weights.clone())?);
    let generator: Arc<dyn Generator> = if dry_run {
        info!("Dry run: dispatches are logged only");
        Arc::new(LogGenerator)
    } else {
        Arc::new(JsonlHandoff::new(config.storage.output_dir.clone()))
    };

    let orchestrator = Orchestrator::new(config.pipeline.clone(), store, catalog, oracle, generator)
        .with_categories(config.catalog.categories.clone())
        .with_lookback_hours(config.catalog.lookback_hours);

    let result = orchestrator.run(day).await?;
    info!(
        "Run {} for {}: ingested {}, duplicates {}, screened {}, selected {}, dispatched {}, errors {}",
        result.state,
        day,
        result.ingested,
        result.duplicates,
        result.screened,
        result.selected,
        result.dispatched,
        result.errors.len()
    );

    if result.state == RunState::Failed {
        error!(
            "Run failed after {:?}: {}",
            result.last_completed,
            result.failure.as_deref().unwrap_or("unknown error")
        );
        anyhow::bail!("run for {} ended FAILED", day);
    }
    Ok(())
}

async fn status_command(store: &ItemStore, day: NaiveDate) -> Result<()> {
    match store.run_status(day).await? {
        Some(status) => {
            println!("{}: {}", day, status.state);
            if let Some(stage) = status.last_completed {
                println!("  last completed: {}", stage);
            }
            if let Some(detail) = status.detail {
                println!("  detail: {}", detail);
            }
        }
        None => println!("{}: no run recorded", day),
    }
    for failure in store.failures(day).await? {
        println!(
            "  failed {} during {} ({} attempts): {}",
            failure.item_id,
            failure.phase.as_str(),
            failure.attempts,
            failure.message
        );
    }
    Ok(())
}
