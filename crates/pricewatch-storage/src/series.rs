//! Append-only trace log: price traces for colors/sizes, availability traces for sizes.

use chrono::{DateTime, NaiveDate, Utc};
use pricewatch_core::{
    Availability, AvailabilityTrace, Color, PriceFields, PriceTrace, SizeId, TraceOwner,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::resolve::color_from_row;
use crate::{decode_micros, decode_owner, Store, StoreError, StoreResult};

/// Compare-and-append attempts before giving up on a hot key.
const APPEND_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl HistoryOrder {
    fn sql(self) -> &'static str {
        match self {
            Self::OldestFirst => "ASC",
            Self::NewestFirst => "DESC",
        }
    }
}

fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl Store {
    /// Appends a price trace unconditionally (still ordered after the latest one).
    pub async fn append_price(
        &self,
        owner: TraceOwner,
        fields: PriceFields,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<PriceTrace> {
        for _ in 0..APPEND_ATTEMPTS {
            let latest = self.latest_price(owner).await?;
            ensure_monotonic(&owner, observed_at, latest.as_ref().map(|t| t.created_at))?;
            if let Some(trace) = self
                .insert_price_after(owner, fields, observed_at, latest.map(|t| t.id))
                .await?
            {
                return Ok(trace);
            }
        }
        Err(StoreError::Contention(owner.to_string()))
    }

    /// Appends only if `fields` differ from the owner's latest trace (null-aware).
    ///
    /// The comparison and the insert are tied together: the row is written only
    /// while the latest trace is still the one that was compared, so two
    /// concurrent ingestions of the same value produce a single trace.
    pub async fn append_price_if_changed(
        &self,
        owner: TraceOwner,
        fields: PriceFields,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<Option<PriceTrace>> {
        for _ in 0..APPEND_ATTEMPTS {
            let latest = self.latest_price(owner).await?;
            if !fields.differs_from(latest.as_ref()) {
                return Ok(None);
            }
            ensure_monotonic(&owner, observed_at, latest.as_ref().map(|t| t.created_at))?;
            if let Some(trace) = self
                .insert_price_after(owner, fields, observed_at, latest.map(|t| t.id))
                .await?
            {
                debug!(%owner, price = trace.price, "appended price trace");
                return Ok(Some(trace));
            }
        }
        Err(StoreError::Contention(owner.to_string()))
    }

    async fn insert_price_after(
        &self,
        owner: TraceOwner,
        fields: PriceFields,
        observed_at: DateTime<Utc>,
        expected_latest: Option<i64>,
    ) -> StoreResult<Option<PriceTrace>> {
        let row = sqlx::query(
            r#"
            INSERT INTO price_traces
                (owner_kind, owner_id, price, old_price, original_price, created_at, created_on)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE (SELECT id FROM price_traces
                     WHERE owner_kind = ?1 AND owner_id = ?2
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1) IS ?8
            RETURNING id
            "#,
        )
        .bind(owner.kind())
        .bind(owner.row_id())
        .bind(fields.price)
        .bind(fields.old_price)
        .bind(fields.original_price)
        .bind(observed_at.timestamp_micros())
        .bind(day_key(self.bucket.date_of(observed_at)))
        .bind(expected_latest)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PriceTrace {
            id: row.try_get("id")?,
            owner,
            price: fields.price,
            old_price: fields.old_price,
            original_price: fields.original_price,
            created_at: decode_micros(observed_at.timestamp_micros())?,
        }))
    }

    pub async fn latest_price(&self, owner: TraceOwner) -> StoreResult<Option<PriceTrace>> {
        Ok(self.recent_prices(owner, 1).await?.into_iter().next())
    }

    /// Newest-first, at most `limit` traces.
    pub async fn recent_prices(&self, owner: TraceOwner, limit: u32) -> StoreResult<Vec<PriceTrace>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_kind, owner_id, price, old_price, original_price, created_at
              FROM price_traces
             WHERE owner_kind = ?1 AND owner_id = ?2
             ORDER BY created_at DESC, id DESC
             LIMIT ?3
            "#,
        )
        .bind(owner.kind())
        .bind(owner.row_id())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_trace_from_row).collect()
    }

    /// Newest-first traces bucketed on or before `date`, at most `limit`.
    pub async fn recent_prices_until(
        &self,
        owner: TraceOwner,
        date: NaiveDate,
        limit: u32,
    ) -> StoreResult<Vec<PriceTrace>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_kind, owner_id, price, old_price, original_price, created_at
              FROM price_traces
             WHERE owner_kind = ?1 AND owner_id = ?2 AND created_on <= ?3
             ORDER BY created_at DESC, id DESC
             LIMIT ?4
            "#,
        )
        .bind(owner.kind())
        .bind(owner.row_id())
        .bind(day_key(date))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_trace_from_row).collect()
    }

    pub async fn price_history(
        &self,
        owner: TraceOwner,
        order: HistoryOrder,
    ) -> StoreResult<Vec<PriceTrace>> {
        let sql = format!(
            r#"
            SELECT id, owner_kind, owner_id, price, old_price, original_price, created_at
              FROM price_traces
             WHERE owner_kind = ?1 AND owner_id = ?2
             ORDER BY created_at {dir}, id {dir}
            "#,
            dir = order.sql()
        );
        let rows = sqlx::query(&sql)
            .bind(owner.kind())
            .bind(owner.row_id())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(price_trace_from_row).collect()
    }

    /// Owners (colors and sizes) that received a price trace on `date`.
    pub async fn price_owners_on(&self, date: NaiveDate) -> StoreResult<Vec<TraceOwner>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT owner_kind, owner_id
              FROM price_traces
             WHERE created_on = ?1
             ORDER BY owner_kind, owner_id
            "#,
        )
        .bind(day_key(date))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<TraceOwner> {
                let kind: String = row.try_get("owner_kind")?;
                decode_owner(&kind, row.try_get("owner_id")?)
            })
            .collect()
    }

    /// Colors that received a price trace on `date`, grouped by product.
    pub async fn colors_priced_on(&self, date: NaiveDate) -> StoreResult<Vec<Color>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT c.id, c.product_id, c.external_id, c.name, c.images
              FROM price_traces t
              JOIN colors c ON c.id = t.owner_id
             WHERE t.owner_kind = 'color' AND t.created_on = ?1
             ORDER BY c.product_id, c.id
            "#,
        )
        .bind(day_key(date))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(color_from_row).collect()
    }

    /// Every price trace created on `date`, oldest first.
    pub async fn price_traces_on(&self, date: NaiveDate) -> StoreResult<Vec<PriceTrace>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_kind, owner_id, price, old_price, original_price, created_at
              FROM price_traces
             WHERE created_on = ?1
             ORDER BY created_at, id
            "#,
        )
        .bind(day_key(date))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_trace_from_row).collect()
    }

    pub async fn append_availability_if_changed(
        &self,
        size_id: SizeId,
        availability: &Availability,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<Option<AvailabilityTrace>> {
        let owner = TraceOwner::Size(size_id);
        for _ in 0..APPEND_ATTEMPTS {
            let latest = self.latest_availability(size_id).await?;
            if !availability.differs_from(latest.as_ref()) {
                return Ok(None);
            }
            ensure_monotonic(&owner, observed_at, latest.as_ref().map(|t| t.created_at))?;

            let row = sqlx::query(
                r#"
                INSERT INTO availability_traces (size_id, availability, created_at, created_on)
                SELECT ?1, ?2, ?3, ?4
                 WHERE (SELECT id FROM availability_traces
                         WHERE size_id = ?1
                         ORDER BY created_at DESC, id DESC
                         LIMIT 1) IS ?5
                RETURNING id
                "#,
            )
            .bind(size_id.0)
            .bind(availability.as_str())
            .bind(observed_at.timestamp_micros())
            .bind(day_key(self.bucket.date_of(observed_at)))
            .bind(latest.map(|t| t.id))
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                return Ok(Some(AvailabilityTrace {
                    id: row.try_get("id")?,
                    size_id,
                    availability: availability.clone(),
                    created_at: decode_micros(observed_at.timestamp_micros())?,
                }));
            }
        }
        Err(StoreError::Contention(owner.to_string()))
    }

    pub async fn latest_availability(&self, size_id: SizeId) -> StoreResult<Option<AvailabilityTrace>> {
        Ok(self
            .availability_history(size_id, HistoryOrder::NewestFirst)
            .await?
            .into_iter()
            .next())
    }

    pub async fn availability_history(
        &self,
        size_id: SizeId,
        order: HistoryOrder,
    ) -> StoreResult<Vec<AvailabilityTrace>> {
        let sql = format!(
            r#"
            SELECT id, size_id, availability, created_at
              FROM availability_traces
             WHERE size_id = ?1
             ORDER BY created_at {dir}, id {dir}
            "#,
            dir = order.sql()
        );
        let rows = sqlx::query(&sql)
            .bind(size_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<AvailabilityTrace> {
                Ok(AvailabilityTrace {
                    id: row.try_get("id")?,
                    size_id: SizeId(row.try_get("size_id")?),
                    availability: Availability::new(row.try_get::<String, _>("availability")?),
                    created_at: decode_micros(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    /// Sizes whose availability changed on `date`.
    pub async fn availability_changes_on(&self, date: NaiveDate) -> StoreResult<Vec<SizeId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT size_id FROM availability_traces WHERE created_on = ?1 ORDER BY size_id",
        )
        .bind(day_key(date))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<SizeId> { Ok(SizeId(row.try_get("size_id")?)) })
            .collect()
    }
}

fn ensure_monotonic(
    owner: &TraceOwner,
    observed_at: DateTime<Utc>,
    latest_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    match latest_at {
        Some(latest_at) if observed_at < latest_at => Err(StoreError::NonMonotonic {
            owner: owner.to_string(),
            observed_at,
            latest_at,
        }),
        _ => Ok(()),
    }
}

fn price_trace_from_row(row: &SqliteRow) -> StoreResult<PriceTrace> {
    let kind: String = row.try_get("owner_kind")?;
    Ok(PriceTrace {
        id: row.try_get("id")?,
        owner: decode_owner(&kind, row.try_get("owner_id")?)?,
        price: row.try_get("price")?,
        old_price: row.try_get("old_price")?,
        original_price: row.try_get("original_price")?,
        created_at: decode_micros(row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pricewatch_core::{ColorDefaults, DayBucket, ExternalId, ProductDefaults};

    async fn store_with_color() -> (Store, TraceOwner) {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let product = store
            .resolve_product(Some(&ExternalId::new("p1")), &ProductDefaults::default())
            .await
            .unwrap()
            .entity;
        let color = store
            .resolve_color(product.id, Some(&ExternalId::new("c1")), &ColorDefaults::default())
            .await
            .unwrap()
            .entity;
        (store, TraceOwner::Color(color.id))
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn unchanged_value_is_not_appended_twice() {
        let (store, owner) = store_with_color().await;
        let first = store
            .append_price_if_changed(owner, PriceFields::new(1999), at(1, 8))
            .await
            .unwrap();
        let second = store
            .append_price_if_changed(owner, PriceFields::new(1999), at(1, 9))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.price_history(owner, HistoryOrder::OldestFirst).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_is_ordered_both_ways() {
        let (store, owner) = store_with_color().await;
        for (i, price) in [1999, 1599, 1799].into_iter().enumerate() {
            store
                .append_price_if_changed(owner, PriceFields::new(price), at(1, 8) + Duration::hours(i as i64))
                .await
                .unwrap();
        }

        let asc: Vec<_> = store
            .price_history(owner, HistoryOrder::OldestFirst)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.price)
            .collect();
        let desc: Vec<_> = store
            .price_history(owner, HistoryOrder::NewestFirst)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.price)
            .collect();
        assert_eq!(asc, vec![1999, 1599, 1799]);
        assert_eq!(desc, vec![1799, 1599, 1999]);
        assert_eq!(store.latest_price(owner).await.unwrap().unwrap().price, 1799);
        assert_eq!(store.recent_prices(owner, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bounded_history_ignores_later_days() {
        let (store, owner) = store_with_color().await;
        for (day, price) in [(1, 2000), (2, 1800), (3, 1500)] {
            store.append_price(owner, PriceFields::new(price), at(day, 8)).await.unwrap();
        }

        let as_of_second = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let prices: Vec<_> = store
            .recent_prices_until(owner, as_of_second, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.price)
            .collect();
        assert_eq!(prices, vec![1800, 2000]);
    }

    #[tokio::test]
    async fn out_of_order_observation_is_rejected() {
        let (store, owner) = store_with_color().await;
        store.append_price(owner, PriceFields::new(100), at(2, 8)).await.unwrap();
        let err = store
            .append_price(owner, PriceFields::new(90), at(1, 8))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonMonotonic { .. }));
    }

    #[tokio::test]
    async fn day_queries_use_the_bucket_offset() {
        let store = Store::open_in_memory("+02:00".parse().unwrap()).await.unwrap();
        let product = store
            .resolve_product(Some(&ExternalId::new("p1")), &ProductDefaults::default())
            .await
            .unwrap()
            .entity;
        let color = store
            .resolve_color(product.id, Some(&ExternalId::new("c1")), &ColorDefaults::default())
            .await
            .unwrap()
            .entity;
        let owner = TraceOwner::Color(color.id);

        // 23:30 UTC on the 1st is already the 2nd at +02:00.
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).single().unwrap();
        store.append_price(owner, PriceFields::new(500), late).await.unwrap();

        let first = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let second = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(store.price_owners_on(first).await.unwrap().is_empty());
        assert_eq!(store.price_owners_on(second).await.unwrap(), vec![owner]);
        assert_eq!(store.colors_priced_on(second).await.unwrap()[0].id, color.id);
        assert_eq!(store.price_traces_on(second).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn traces_cannot_be_rewritten() {
        let (store, owner) = store_with_color().await;
        store.append_price(owner, PriceFields::new(100), at(1, 8)).await.unwrap();

        let update = sqlx::query("UPDATE price_traces SET price = 1")
            .execute(&store.pool)
            .await;
        let delete = sqlx::query("DELETE FROM price_traces").execute(&store.pool).await;
        assert!(update.is_err());
        assert!(delete.is_err());
        assert_eq!(store.latest_price(owner).await.unwrap().unwrap().price, 100);
    }

    #[tokio::test]
    async fn availability_collapses_repeated_states() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let product = store
            .resolve_product(Some(&ExternalId::new("p1")), &ProductDefaults::default())
            .await
            .unwrap()
            .entity;
        let color = store
            .resolve_color(product.id, Some(&ExternalId::new("c1")), &ColorDefaults::default())
            .await
            .unwrap()
            .entity;
        let size = store
            .resolve_size(color.id, Some(&ExternalId::new("s1")), &Default::default())
            .await
            .unwrap()
            .entity;

        for (hour, state) in [(8, "in_stock"), (9, "in_stock"), (10, "out_of_stock"), (11, "in_stock")] {
            store
                .append_availability_if_changed(size.id, &Availability::new(state), at(1, hour))
                .await
                .unwrap();
        }

        let states: Vec<_> = store
            .availability_history(size.id, HistoryOrder::OldestFirst)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.availability.0)
            .collect();
        assert_eq!(states, vec!["in_stock", "out_of_stock", "in_stock"]);
        assert_eq!(
            store.availability_changes_on(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()).await.unwrap(),
            vec![size.id]
        );
    }
}
