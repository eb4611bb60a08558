use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use pricewatch_core::{DayBucket, NotificationPayload, ProductSnapshot};
use pricewatch_feed::{JsonDirFeed, StaticFeed};
use pricewatch_notify::{Notifier, NotifyError};
use pricewatch_storage::{Store, StoreConfig};
use pricewatch_sync::{CyclePipeline, SyncConfig};
use tempfile::tempdir;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<NotificationPayload>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    fn name(&self) -> &str {
        "failing"
    }

    async fn deliver(&self, _payload: &NotificationPayload) -> Result<(), NotifyError> {
        Err(NotifyError::RateLimited { attempts: 3 })
    }
}

fn config(root: &Path, threshold: f64) -> SyncConfig {
    SyncConfig {
        database_url: format!("sqlite://{}", root.join("pricewatch.db").display()),
        drop_threshold: threshold,
        day_bucket: DayBucket::utc(),
        snapshots_dir: root.join("snapshots"),
        scheduler_enabled: false,
        cycle_cron: "0 0 7 * * *".into(),
        telegram_token: None,
        telegram_chat_id: None,
        workspace_root: root.to_path_buf(),
    }
}

fn write_snapshot(dir: &Path, day: u32, price: i64, old_price: Option<i64>) {
    let snapshot = serde_json::json!({
        "externalId": 348001,
        "market": "WOMAN",
        "name": "Linen dress",
        "category": "dresses",
        "description": "Midi dress in linen",
        "url": "https://shop.example/p/348001",
        "observedAt": format!("2026-03-{day:02}T07:00:00Z"),
        "colors": [{
            "externalId": 250,
            "name": "Ecru",
            "images": ["https://img.example/ecru-1.jpg", "https://img.example/ecru-2.jpg"],
            "price": price,
            "old_price": old_price,
            "sizes": [{"externalId": 7, "name": "M", "availability": "in_stock"}]
        }]
    });
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("products.json"), serde_json::to_vec(&snapshot).unwrap()).unwrap();
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
}

async fn pipeline(root: &Path, threshold: f64, notifier: Arc<dyn Notifier>) -> CyclePipeline {
    let cfg = config(root, threshold);
    let store = Store::open(&StoreConfig::new(cfg.database_url.clone(), cfg.day_bucket))
        .await
        .unwrap();
    let feed = Box::new(JsonDirFeed::new(cfg.snapshots_dir.clone()));
    CyclePipeline::new(cfg, store, feed, notifier)
}

#[tokio::test]
async fn three_cycles_flag_a_thirty_percent_drop_and_render_history() {
    let root = tempdir().expect("tempdir");
    let snapshots = root.path().join("snapshots");
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = pipeline(root.path(), 30.0, notifier.clone()).await;

    // The second cycle keeps the price but starts showing a struck-through old
    // price, so it is a distinct observation with an unchanged price.
    write_snapshot(&snapshots, 1, 2000, None);
    let first = pipeline.run_once_as_of(day(1)).await.unwrap();
    write_snapshot(&snapshots, 2, 2000, Some(2500));
    let second = pipeline.run_once_as_of(day(2)).await.unwrap();
    write_snapshot(&snapshots, 3, 1400, Some(2500));
    let third = pipeline.run_once_as_of(day(3)).await.unwrap();

    assert_eq!(first.ingest.products_created, 1);
    assert_eq!(first.flagged_products, 0);
    assert_eq!(second.ingest.price_traces, 1);
    assert_eq!(second.flagged_products, 0);
    assert_eq!(third.flagged_products, 1);
    assert_eq!(third.notifications_sent, 1);

    let sent = notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let payload = &sent[0];
    assert_eq!(payload.market, "WOMAN");
    assert_eq!(payload.images.len(), 2);
    assert_eq!(
        payload.text,
        "*Linen dress*\n\n_Ecru_\n2026-03-01: 20.00\n2026-03-02: 20.00 (+0%)\n2026-03-03: 14.00 (-30%)\n\n[Product page](https://shop.example/p/348001)"
    );

    let drops: serde_json::Value = serde_json::from_slice(
        &std::fs::read(Path::new(&third.reports_dir).join("drops.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(drops["drops"][0]["triggering"][0]["drop_percent"], 30.0);
    assert!(Path::new(&third.parquet_manifest).exists());
    assert!(Path::new(&third.reports_dir).join("cycle_brief.md").exists());

    pipeline.close().await;
}

#[tokio::test]
async fn replaying_a_cycle_adds_no_traces_and_delivery_failures_are_counted() {
    let root = tempdir().expect("tempdir");
    let snapshots = root.path().join("snapshots");
    let pipeline = pipeline(root.path(), 25.0, Arc::new(FailingNotifier)).await;

    write_snapshot(&snapshots, 1, 4000, None);
    pipeline.run_once_as_of(day(1)).await.unwrap();
    write_snapshot(&snapshots, 2, 2000, None);
    let dropped = pipeline.run_once_as_of(day(2)).await.unwrap();
    let replay = pipeline.run_once_as_of(day(2)).await.unwrap();

    assert_eq!(dropped.flagged_products, 1);
    assert_eq!(dropped.notifications_failed, 1);
    assert_eq!(replay.ingest.price_traces, 0);
    assert_eq!(replay.ingest.availability_traces, 0);
    assert_eq!(replay.flagged_products, 1, "detection is recomputed from stored state");

    pipeline.close().await;
}

#[tokio::test]
async fn unpinned_cycle_detects_on_the_day_ingestion_stamped() {
    let root = tempdir().expect("tempdir");
    let cfg = config(root.path(), 25.0);
    let store = Store::open(&StoreConfig::new(cfg.database_url.clone(), cfg.day_bucket))
        .await
        .unwrap();
    let snapshot: ProductSnapshot = serde_json::from_value(serde_json::json!({
        "externalId": 51002,
        "market": "MAN",
        "name": "Wool coat",
        "url": "https://shop.example/p/51002",
        "colors": [{"externalId": 800, "name": "Navy", "price": 12999}]
    }))
    .unwrap();
    let feed = Box::new(StaticFeed::new(vec![snapshot]));
    let pipeline = CyclePipeline::new(cfg, store, feed, Arc::new(RecordingNotifier::default()));

    let before = DayBucket::utc().today();
    let summary = pipeline.run_once().await.unwrap();
    let after = DayBucket::utc().today();

    assert!(before <= summary.as_of && summary.as_of <= after);
    assert_eq!(summary.ingest.price_traces, 1);
    let traces = pipeline.store().price_traces_on(summary.as_of).await.unwrap();
    assert_eq!(traces.len(), 1, "the day's trace lands in the cycle's own bucket");

    pipeline.close().await;
}
