//! Snapshot ingestion: resolves product/color/size rows and appends a trace
//! only where the observed value moved.

use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use pricewatch_core::{ColorId, ColorSnapshot, ProductId, ProductSnapshot, SizeSnapshot, TraceOwner};
use pricewatch_storage::{Store, StoreError, StoreResult};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub products_created: usize,
    pub colors_created: usize,
    pub sizes_created: usize,
    pub price_traces: usize,
    pub availability_traces: usize,
    /// Items dropped for a missing identity or a storage failure.
    pub skipped: usize,
}

impl AddAssign for IngestOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.products_created += rhs.products_created;
        self.colors_created += rhs.colors_created;
        self.sizes_created += rhs.sizes_created;
        self.price_traces += rhs.price_traces;
        self.availability_traces += rhs.availability_traces;
        self.skipped += rhs.skipped;
    }
}

pub struct Ingestor<'a> {
    store: &'a Store,
}

impl<'a> Ingestor<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Ingests at the snapshot's own `observedAt`, or now.
    pub async fn ingest(&self, snapshot: &ProductSnapshot) -> StoreResult<IngestOutcome> {
        let at = snapshot.observed_at.unwrap_or_else(Utc::now);
        self.ingest_at(snapshot, at).await
    }

    /// A product without identity is skipped whole; a failing color or size is
    /// logged and its siblings still go through. Only a failure on the product
    /// row itself is returned.
    pub async fn ingest_at(&self, snapshot: &ProductSnapshot, at: DateTime<Utc>) -> StoreResult<IngestOutcome> {
        let mut outcome = IngestOutcome::default();

        let product = match self
            .store
            .resolve_product(snapshot.external_id.as_ref(), &snapshot.defaults())
            .await
        {
            Ok(resolved) => resolved,
            Err(StoreError::InvalidIdentity { .. }) => {
                warn!(name = %snapshot.name, "product snapshot has no external id, skipping");
                outcome.skipped += 1;
                return Ok(outcome);
            }
            Err(err) => return Err(err),
        };
        outcome.products_created += usize::from(product.was_created);

        for color in &snapshot.colors {
            match self.ingest_color(product.entity.id, color, at).await {
                Ok(color_outcome) => outcome += color_outcome,
                Err(err) => {
                    warn!(
                        product = %product.entity.external_id,
                        color = %color.name,
                        error = %err,
                        "skipping color"
                    );
                    outcome.skipped += 1;
                }
            }
        }

        debug!(product = %product.entity.external_id, ?outcome, "ingested snapshot");
        Ok(outcome)
    }

    async fn ingest_color(
        &self,
        product_id: ProductId,
        snapshot: &ColorSnapshot,
        at: DateTime<Utc>,
    ) -> StoreResult<IngestOutcome> {
        let mut outcome = IngestOutcome::default();
        let color = self
            .store
            .resolve_color(product_id, snapshot.external_id.as_ref(), &snapshot.defaults())
            .await?;
        outcome.colors_created += usize::from(color.was_created);

        match snapshot.price_fields() {
            Some(fields) => {
                let appended = self
                    .store
                    .append_price_if_changed(TraceOwner::Color(color.entity.id), fields, at)
                    .await?;
                outcome.price_traces += usize::from(appended.is_some());
            }
            None => warn!(color_id = %color.entity.id, "color listing has no price, not tracing"),
        }

        for size in &snapshot.sizes {
            match self.ingest_size(color.entity.id, size, at).await {
                Ok(size_outcome) => outcome += size_outcome,
                Err(err) => {
                    warn!(color_id = %color.entity.id, size = %size.name, error = %err, "skipping size");
                    outcome.skipped += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn ingest_size(
        &self,
        color_id: ColorId,
        snapshot: &SizeSnapshot,
        at: DateTime<Utc>,
    ) -> StoreResult<IngestOutcome> {
        let mut outcome = IngestOutcome::default();
        let size = self
            .store
            .resolve_size(color_id, snapshot.external_id.as_ref(), &snapshot.defaults())
            .await?;
        outcome.sizes_created += usize::from(size.was_created);

        if let Some(availability) = &snapshot.availability {
            let appended = self
                .store
                .append_availability_if_changed(size.entity.id, availability, at)
                .await?;
            outcome.availability_traces += usize::from(appended.is_some());
        }
        if let Some(fields) = snapshot.price_fields() {
            let appended = self
                .store
                .append_price_if_changed(TraceOwner::Size(size.entity.id), fields, at)
                .await?;
            outcome.price_traces += usize::from(appended.is_some());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pricewatch_core::{Availability, DayBucket, ExternalId};
    use pricewatch_storage::HistoryOrder;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 8, 0, 0).single().unwrap()
    }

    fn mk_snapshot(price: i64, old_price: Option<i64>) -> ProductSnapshot {
        ProductSnapshot {
            external_id: Some(ExternalId::new("348001")),
            market: "WOMAN".into(),
            name: "Linen dress".into(),
            category: "dresses".into(),
            description: String::new(),
            url: "https://shop.example/p/348001".into(),
            colors: vec![ColorSnapshot {
                external_id: Some(ExternalId::new("250")),
                name: "Ecru".into(),
                images: vec!["a.jpg".into()],
                price: Some(price),
                old_price,
                original_price: None,
                sizes: vec![SizeSnapshot {
                    external_id: Some(ExternalId::new("7")),
                    name: "M".into(),
                    availability: Some(Availability::new("in_stock")),
                    price: None,
                    old_price: None,
                    original_price: None,
                }],
            }],
            observed_at: None,
        }
    }

    async fn color_prices(store: &Store) -> Vec<(i64, Option<i64>)> {
        let product = store.product_by_external_id("348001").await.unwrap().unwrap();
        let color = &store.colors_of(product.id).await.unwrap()[0];
        store
            .price_history(TraceOwner::Color(color.id), HistoryOrder::OldestFirst)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.price, t.old_price))
            .collect()
    }

    #[tokio::test]
    async fn repeated_snapshot_is_a_no_op() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let ingestor = Ingestor::new(&store);

        let first = ingestor.ingest_at(&mk_snapshot(1999, None), at(1)).await.unwrap();
        let second = ingestor.ingest_at(&mk_snapshot(1999, None), at(2)).await.unwrap();

        assert_eq!(first.products_created, 1);
        assert_eq!(first.price_traces, 1);
        assert_eq!(first.availability_traces, 1);
        assert_eq!(second, IngestOutcome::default());
        assert_eq!(color_prices(&store).await, vec![(1999, None)]);
    }

    #[tokio::test]
    async fn price_change_is_captured_in_order() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let ingestor = Ingestor::new(&store);

        ingestor.ingest_at(&mk_snapshot(1999, None), at(1)).await.unwrap();
        ingestor.ingest_at(&mk_snapshot(1599, None), at(2)).await.unwrap();

        assert_eq!(color_prices(&store).await, vec![(1999, None), (1599, None)]);
    }

    #[tokio::test]
    async fn appearing_old_price_is_a_change() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let ingestor = Ingestor::new(&store);

        ingestor.ingest_at(&mk_snapshot(1999, None), at(1)).await.unwrap();
        let outcome = ingestor.ingest_at(&mk_snapshot(1999, Some(1999)), at(2)).await.unwrap();

        assert_eq!(outcome.price_traces, 1);
        assert_eq!(color_prices(&store).await, vec![(1999, None), (1999, Some(1999))]);
    }

    #[tokio::test]
    async fn items_without_identity_are_skipped_and_siblings_continue() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let ingestor = Ingestor::new(&store);

        let mut snapshot = mk_snapshot(1999, None);
        let mut anonymous = snapshot.colors[0].clone();
        anonymous.external_id = None;
        snapshot.colors.insert(0, anonymous);
        snapshot.colors[1].sizes.push(SizeSnapshot {
            external_id: None,
            name: "XL".into(),
            availability: Some(Availability::new("out_of_stock")),
            price: None,
            old_price: None,
            original_price: None,
        });

        let outcome = ingestor.ingest_at(&snapshot, at(1)).await.unwrap();
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.colors_created, 1);
        assert_eq!(outcome.sizes_created, 1);

        let mut nameless = mk_snapshot(1999, None);
        nameless.external_id = None;
        let outcome = ingestor.ingest_at(&nameless, at(2)).await.unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(store.product_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn size_price_is_traced_separately() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let ingestor = Ingestor::new(&store);

        let mut snapshot = mk_snapshot(1999, None);
        snapshot.colors[0].sizes[0].price = Some(2099);
        let outcome = ingestor.ingest_at(&snapshot, at(1)).await.unwrap();

        assert_eq!(outcome.price_traces, 2);
        assert_eq!(outcome.sizes_created, 1);
    }
}
