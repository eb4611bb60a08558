//! Renders a product's price history into the message handed to a notifier.

use pricewatch_core::{format_minor_units, DayBucket, NotificationPayload, PriceTrace, Product, TraceOwner};
use pricewatch_storage::{HistoryOrder, Store, StoreResult};

pub struct Composer<'a> {
    store: &'a Store,
}

impl<'a> Composer<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn compose(&self, product: &Product) -> StoreResult<NotificationPayload> {
        let bucket = self.store.day_bucket();
        let mut text = format!("*{}*\n\n", product.name);
        let mut images = Vec::new();

        for color in self.store.colors_of(product.id).await? {
            if images.is_empty() && !color.images.is_empty() {
                images = color.images.clone();
            }
            let history = self
                .store
                .price_history(TraceOwner::Color(color.id), HistoryOrder::OldestFirst)
                .await?;
            if history.is_empty() {
                continue;
            }
            text.push_str(&format!("_{}_\n", color.name));
            text.push_str(&history_lines(&history, bucket).join("\n"));
            text.push_str("\n\n");
        }

        text.push_str(&format!("[Product page]({})", product.url));
        Ok(NotificationPayload {
            market: product.market.clone(),
            images,
            text,
        })
    }
}

/// `YYYY-MM-DD: 20.00 (-30%)`, oldest first; the first entry has no change.
pub fn history_lines(history: &[PriceTrace], bucket: DayBucket) -> Vec<String> {
    let mut previous: Option<i64> = None;
    history
        .iter()
        .map(|trace| {
            let change = previous
                .filter(|last| *last != 0)
                .map(|last| {
                    let pct = (trace.price - last) as f64 / last as f64 * 100.0;
                    format!(" ({:+}%)", pct.round() as i64)
                })
                .unwrap_or_default();
            previous = Some(trace.price);
            format!(
                "{}: {}{}",
                bucket.date_of(trace.created_at).format("%Y-%m-%d"),
                format_minor_units(trace.price),
                change
            )
        })
        .collect()
}
