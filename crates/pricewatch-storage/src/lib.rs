//! Durable, append-only storage for pricewatch (SQLite via sqlx).
//!
//! A [`Store`] is opened once per run and handed to the ingestor and the change
//! detector. Identity resolution and trace appends rely on uniqueness
//! constraints and single-statement conditional inserts, so concurrent callers
//! never need an in-process lock.

mod resolve;
mod series;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pricewatch_core::{DayBucket, EntityKind, TraceOwner};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

pub use resolve::Resolved;
pub use series::HistoryOrder;

pub const CRATE_NAME: &str = "pricewatch-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DAY_BUCKET_KEY: &str = "day_bucket_offset";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} is missing its external id")]
    InvalidIdentity { kind: EntityKind },
    #[error("trace for {owner} observed at {observed_at} predates latest trace at {latest_at}")]
    NonMonotonic {
        owner: String,
        observed_at: DateTime<Utc>,
        latest_at: DateTime<Utc>,
    },
    #[error("store buckets days at utc offset {stored}, configured offset is {configured}")]
    TimeZoneMismatch { stored: String, configured: String },
    #[error("gave up appending to {0} after repeated concurrent writes")]
    Contention(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("encoding json column: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub day_bucket: DayBucket,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>, day_bucket: DayBucket) -> Self {
        Self {
            database_url: database_url.into(),
            day_bucket,
            max_connections: 4,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

/// Explicit storage handle: open at start, [`Store::close`] at the end.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    bucket: DayBucket,
}

impl Store {
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;
        info!(database_url = %config.database_url, offset = %config.day_bucket, "opened store");
        Self::prepare(pool, config.day_bucket).await
    }

    /// Private in-memory database; a single connection keeps every query on it.
    pub async fn open_in_memory(bucket: DayBucket) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::prepare(pool, bucket).await
    }

    async fn prepare(pool: SqlitePool, bucket: DayBucket) -> StoreResult<Self> {
        MIGRATOR.run(&pool).await?;

        let configured = bucket.label();
        sqlx::query("INSERT INTO store_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO NOTHING")
            .bind(DAY_BUCKET_KEY)
            .bind(&configured)
            .execute(&pool)
            .await?;
        let stored: String = sqlx::query("SELECT value FROM store_meta WHERE key = ?1")
            .bind(DAY_BUCKET_KEY)
            .fetch_one(&pool)
            .await?
            .try_get("value")?;
        if stored != configured {
            pool.close().await;
            return Err(StoreError::TimeZoneMismatch { stored, configured });
        }

        Ok(Self { pool, bucket })
    }

    pub fn day_bucket(&self) -> DayBucket {
        self.bucket
    }

    /// Waits for in-flight queries and closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn decode_micros(micros: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {micros}")))
}

fn decode_owner(kind: &str, id: i64) -> StoreResult<TraceOwner> {
    match kind {
        "color" => Ok(TraceOwner::Color(pricewatch_core::ColorId(id))),
        "size" => Ok(TraceOwner::Size(pricewatch_core::SizeId(id))),
        other => Err(StoreError::Corrupt(format!("unknown trace owner kind {other:?}"))),
    }
}
