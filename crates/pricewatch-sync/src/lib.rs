//! Cycle orchestration: feed -> ingest -> detect -> compose -> notify, plus the
//! configuration, scheduling and per-cycle reports around it.

pub mod compose;
pub mod detect;
pub mod ingest;
mod reports;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use pricewatch_core::DayBucket;
use pricewatch_feed::{JsonDirFeed, SnapshotFeed};
use pricewatch_notify::{LogNotifier, Notifier, TelegramConfig, TelegramNotifier};
use pricewatch_storage::{Store, StoreConfig};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub use compose::Composer;
pub use detect::{drop_percent, ChangeDetector, ColorDrop, ProductDrop, DEFAULT_DROP_THRESHOLD};
pub use ingest::{IngestOutcome, Ingestor};
pub use reports::{ManifestFile, ReportManifest};

pub const CRATE_NAME: &str = "pricewatch-sync";

/// Catalog sections tracked when `markets.yaml` does not list any.
pub const DEFAULT_TRACKED_SECTIONS: [&str; 5] = ["WOMAN", "MAN", "KID", "BEAUTY", "ZARA ORIGINS"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketRegistry {
    #[serde(default)]
    pub markets: BTreeMap<String, MarketConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketConfig {
    /// Telegram forum thread receiving this market's notifications.
    #[serde(default)]
    pub thread_id: Option<i64>,
}

impl MarketRegistry {
    pub fn thread_ids(&self) -> HashMap<String, i64> {
        self.markets
            .iter()
            .filter_map(|(market, cfg)| cfg.thread_id.map(|id| (market.clone(), id)))
            .collect()
    }

    pub fn tracked_sections(&self) -> Vec<String> {
        if self.markets.is_empty() {
            DEFAULT_TRACKED_SECTIONS.iter().map(|s| s.to_string()).collect()
        } else {
            self.markets.keys().cloned().collect()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub drop_threshold: f64,
    pub day_bucket: DayBucket,
    pub snapshots_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub cycle_cron: String,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    /// Reads the environment, falling back to defaults for anything unset.
    /// Malformed threshold or offset values are errors rather than defaults.
    pub fn from_env() -> Result<Self> {
        let drop_threshold = match std::env::var("PRICEWATCH_DROP_THRESHOLD") {
            Ok(raw) => parse_threshold(&raw)?,
            Err(_) => DEFAULT_DROP_THRESHOLD,
        };
        let day_bucket = match std::env::var("PRICEWATCH_UTC_OFFSET") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("parsing PRICEWATCH_UTC_OFFSET={raw:?}"))?,
            Err(_) => DayBucket::utc(),
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://pricewatch.db".to_string()),
            drop_threshold,
            day_bucket,
            snapshots_dir: std::env::var("PRICEWATCH_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            scheduler_enabled: std::env::var("PRICEWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cycle_cron: std::env::var("PRICEWATCH_CYCLE_CRON").unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            telegram_token: non_empty_env("TG_TOKEN"),
            telegram_chat_id: non_empty_env("TG_CHAT_ID"),
            workspace_root: PathBuf::from("."),
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database_url.clone(), self.day_bucket)
    }

    /// `markets.yaml` at the workspace root; absent file means no routing.
    pub async fn load_market_registry(&self) -> Result<MarketRegistry> {
        let path = self.workspace_root.join("markets.yaml");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(MarketRegistry::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Telegram when both credentials are present, otherwise log-only.
    pub async fn build_notifier(&self) -> Result<Arc<dyn Notifier>> {
        match (&self.telegram_token, &self.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                let mut telegram = TelegramConfig::new(token.clone(), chat_id.clone());
                telegram.threads = self.load_market_registry().await?.thread_ids();
                let notifier = TelegramNotifier::new(telegram).context("building telegram notifier")?;
                Ok(Arc::new(notifier))
            }
            _ => {
                info!("telegram credentials not set, notifications go to the log");
                Ok(Arc::new(LogNotifier))
            }
        }
    }
}

pub fn parse_threshold(raw: &str) -> Result<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("drop threshold {raw:?} is not a number"))?;
    validate_threshold(value)
}

pub fn validate_threshold(value: f64) -> Result<f64> {
    anyhow::ensure!(
        value.is_finite() && (0.0..=100.0).contains(&value),
        "drop threshold must be between 0 and 100, got {value}"
    );
    Ok(value)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub as_of: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshots: usize,
    pub ingest: IngestOutcome,
    pub failed_products: usize,
    pub flagged_products: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryTally {
    pub sent: usize,
    pub failed: usize,
}

pub struct CyclePipeline {
    config: SyncConfig,
    store: Store,
    feed: Box<dyn SnapshotFeed>,
    notifier: Arc<dyn Notifier>,
    cycle_lock: Mutex<()>,
}

impl CyclePipeline {
    pub fn new(config: SyncConfig, store: Store, feed: Box<dyn SnapshotFeed>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            store,
            feed,
            notifier,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Opens the store and wires the JSON directory feed and the configured notifier.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = Store::open(&config.store_config())
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        let feed = Box::new(JsonDirFeed::new(config.snapshots_dir.clone()));
        let notifier = config.build_notifier().await?;
        Ok(Self::new(config, store, feed, notifier))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full cycle for the current day. The day is read once ingestion has
    /// drained, so a cycle that runs past midnight detects on the day its
    /// traces were stamped with.
    pub async fn run_once(&self) -> Result<CycleSummary> {
        self.run_locked(None).await
    }

    /// One full cycle with detection pinned to `as_of`. Cycles never overlap:
    /// detection only starts once this cycle's ingestion has drained.
    pub async fn run_once_as_of(&self, as_of: NaiveDate) -> Result<CycleSummary> {
        self.run_locked(Some(as_of)).await
    }

    async fn run_locked(&self, as_of: Option<NaiveDate>) -> Result<CycleSummary> {
        let _cycle = self.cycle_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id, as_of = field::Empty, feed = self.feed.feed_id());
        if let Some(as_of) = as_of {
            span.record("as_of", field::display(as_of));
        }
        self.run_cycle(run_id, as_of).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid, as_of: Option<NaiveDate>) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let snapshots = self.feed.load().await.context("loading snapshots")?;
        info!(count = snapshots.len(), "loaded snapshots");

        let ingestor = Ingestor::new(&self.store);
        let mut ingest = IngestOutcome::default();
        let mut failed_products = 0usize;
        for snapshot in &snapshots {
            match ingestor.ingest(snapshot).await {
                Ok(outcome) => ingest += outcome,
                Err(err) => {
                    failed_products += 1;
                    error!(product = ?snapshot.external_id, error = %err, "ingesting product failed");
                }
            }
        }
        info!(?ingest, failed_products, "ingestion drained");

        let as_of = match as_of {
            Some(day) => day,
            None => {
                let today = self.store.day_bucket().today();
                Span::current().record("as_of", field::display(today));
                today
            }
        };
        let drops = ChangeDetector::new(&self.store)
            .detect_drops(as_of, self.config.drop_threshold)
            .await
            .context("detecting price drops")?;
        let delivery = self.notify_drops(&drops).await?;

        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        let mut summary = CycleSummary {
            run_id,
            as_of,
            started_at,
            finished_at: Utc::now(),
            snapshots: snapshots.len(),
            ingest,
            failed_products,
            flagged_products: drops.len(),
            notifications_sent: delivery.sent,
            notifications_failed: delivery.failed,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: String::new(),
        };

        let traces = self
            .store
            .price_traces_on(as_of)
            .await
            .context("loading the day's price traces")?;
        let manifest_path = reports::export_parquet_snapshots(&reports_dir, &traces, &drops).await?;
        summary.parquet_manifest = manifest_path.display().to_string();
        reports::write_reports(&reports_dir, &summary, &drops).await?;

        info!(
            flagged = summary.flagged_products,
            sent = delivery.sent,
            failed = delivery.failed,
            "cycle complete"
        );
        Ok(summary)
    }

    /// Composes and hands every flagged product to the notifier. A failed
    /// delivery is logged and counted; it never feeds back into detection.
    pub async fn notify_drops(&self, drops: &[ProductDrop]) -> Result<DeliveryTally> {
        let composer = Composer::new(&self.store);
        let mut tally = DeliveryTally::default();
        for drop in drops {
            let payload = composer
                .compose(&drop.product)
                .await
                .with_context(|| format!("composing notification for {}", drop.product.external_id))?;
            match self.notifier.deliver(&payload).await {
                Ok(()) => tally.sent += 1,
                Err(err) => {
                    tally.failed += 1;
                    warn!(
                        product = %drop.product.external_id,
                        notifier = self.notifier.name(),
                        error = %err,
                        "notification not delivered"
                    );
                }
            }
        }
        Ok(tally)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.cycle_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, flagged = summary.flagged_products, "scheduled cycle finished"),
                    Err(err) => error!(error = %err, "scheduled cycle failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    pub async fn close(self) {
        self.store.close().await;
    }
}

pub async fn run_cycle_once_from_env() -> Result<CycleSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = CyclePipeline::from_config(config).await?;
    let summary = pipeline.run_once().await;
    pipeline.close().await;
    summary
}
