use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use pricewatch_core::{format_minor_units, TraceOwner};
use pricewatch_feed::{category_targets, load_snapshot_file, CatalogPayload};
use pricewatch_storage::{HistoryOrder, Store};
use pricewatch_sync::compose::history_lines;
use pricewatch_sync::{ChangeDetector, CyclePipeline, IngestOutcome, Ingestor, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Retail price tracker: ingest snapshots, detect drops, notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full cycle over the snapshots directory.
    Cycle,
    /// Ingest snapshot files without running detection.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Report products whose price dropped on a given day.
    Detect {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        threshold: Option<f64>,
        /// Also compose and deliver notifications for the flagged products.
        #[arg(long)]
        notify: bool,
    },
    /// Print the stored price history of a product.
    History { external_id: String },
    /// Create or upgrade the database schema.
    Migrate,
    /// List the category listings of a catalog payload.
    Categories {
        file: PathBuf,
        #[arg(long = "section")]
        sections: Vec<String>,
    },
    /// Run cycles on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Cycle) {
        Commands::Cycle => {
            let summary = pricewatch_sync::run_cycle_once_from_env().await?;
            println!(
                "cycle complete: run_id={} day={} snapshots={} flagged={} sent={} reports={}",
                summary.run_id,
                summary.as_of,
                summary.snapshots,
                summary.flagged_products,
                summary.notifications_sent,
                summary.reports_dir
            );
        }
        Commands::Ingest { files } => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let ingestor = Ingestor::new(&store);
            let mut total = IngestOutcome::default();
            for file in &files {
                let snapshots = load_snapshot_file(file)?;
                for snapshot in &snapshots {
                    total += ingestor
                        .ingest(snapshot)
                        .await
                        .with_context(|| format!("ingesting {}", file.display()))?;
                }
            }
            store.close().await;
            println!(
                "ingested {} file(s): products_created={} price_traces={} availability_traces={} skipped={}",
                files.len(),
                total.products_created,
                total.price_traces,
                total.availability_traces,
                total.skipped
            );
        }
        Commands::Detect { date, threshold, notify } => {
            let mut config = SyncConfig::from_env()?;
            if let Some(threshold) = threshold {
                config.drop_threshold = pricewatch_sync::validate_threshold(threshold)?;
            }
            let pipeline = CyclePipeline::from_config(config).await?;
            let as_of = date.unwrap_or_else(|| pipeline.store().day_bucket().today());
            let drops = ChangeDetector::new(pipeline.store())
                .detect_drops(as_of, pipeline.config().drop_threshold)
                .await?;

            for drop in &drops {
                for color in &drop.triggering {
                    println!(
                        "{}\t{}\t{}\t{} -> {}\t-{:.1}%",
                        drop.product.external_id,
                        drop.product.name,
                        color.color.name,
                        format_minor_units(color.previous),
                        format_minor_units(color.current),
                        color.drop_percent
                    );
                }
            }
            println!("{} product(s) flagged on {as_of}", drops.len());

            if notify {
                let tally = pipeline.notify_drops(&drops).await?;
                println!("notifications: sent={} failed={}", tally.sent, tally.failed);
            }
            pipeline.close().await;
        }
        Commands::History { external_id } => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let Some(product) = store.product_by_external_id(&external_id).await? else {
                store.close().await;
                bail!("no product with external id {external_id}");
            };

            println!("{} [{}] {}", product.name, product.market, product.url);
            for color in store.colors_of(product.id).await? {
                println!("  {} ({})", color.name, color.external_id);
                let history = store
                    .price_history(TraceOwner::Color(color.id), HistoryOrder::OldestFirst)
                    .await?;
                for line in history_lines(&history, store.day_bucket()) {
                    println!("    {line}");
                }
                for size in store.sizes_of(color.id).await? {
                    let states = store
                        .availability_history(size.id, HistoryOrder::OldestFirst)
                        .await?
                        .into_iter()
                        .map(|t| t.availability.0)
                        .collect::<Vec<_>>();
                    println!("    size {}: {}", size.name, states.join(" -> "));
                }
            }
            store.close().await;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            store.close().await;
            println!("schema up to date: {} (day bucket {})", config.database_url, config.day_bucket);
        }
        Commands::Categories { file, sections } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let payload: CatalogPayload =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
            let sections = if sections.is_empty() {
                SyncConfig::from_env()?.load_market_registry().await?.tracked_sections()
            } else {
                sections
            };
            for target in category_targets(&payload, &sections) {
                println!("{}\t{}\t{}", target.market, target.id, target.name);
            }
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            let pipeline = Arc::new(CyclePipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set PRICEWATCH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %pipeline.config().cycle_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Store> {
    Store::open(&config.store_config())
        .await
        .with_context(|| format!("opening store {}", config.database_url))
}
