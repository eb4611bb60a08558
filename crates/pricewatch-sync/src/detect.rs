//! Percentage-drop detection over the stored price history.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use pricewatch_core::{format_minor_units, Color, MinorUnits, Product, ProductId, TraceOwner};
use pricewatch_storage::{Store, StoreError, StoreResult};
use serde::Serialize;
use tracing::info;

pub const DEFAULT_DROP_THRESHOLD: f64 = 25.0;

/// Relative decrease from `previous` to `current` in percent, `None` unless
/// the price actually went down from a positive amount.
pub fn drop_percent(previous: MinorUnits, current: MinorUnits) -> Option<f64> {
    if previous <= 0 || current >= previous {
        return None;
    }
    Some((previous - current) as f64 / previous as f64 * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColorDrop {
    pub color: Color,
    pub previous: MinorUnits,
    pub current: MinorUnits,
    pub drop_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductDrop {
    pub product: Product,
    pub triggering: Vec<ColorDrop>,
}

pub struct ChangeDetector<'a> {
    store: &'a Store,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Products with a color whose latest price, as of the end of `as_of`, is at
    /// least `threshold` percent below the one before it.
    ///
    /// Candidates are products with any color price trace bucketed on `as_of`.
    /// Reads only; running it twice for the same date gives the same answer.
    pub async fn detect_drops(&self, as_of: NaiveDate, threshold: f64) -> StoreResult<Vec<ProductDrop>> {
        let candidates = self
            .store
            .colors_priced_on(as_of)
            .await?
            .into_iter()
            .map(|color| color.product_id)
            .collect::<BTreeSet<ProductId>>();
        info!(%as_of, candidates = candidates.len(), threshold, "detecting price drops");

        let mut drops = Vec::new();
        for product_id in candidates {
            let product = self
                .store
                .product(product_id)
                .await?
                .ok_or_else(|| StoreError::Corrupt(format!("product {product_id} has traces but no row")))?;

            let mut triggering = Vec::new();
            for color in self.store.colors_of(product_id).await? {
                if let Some(drop) = self.color_drop(&product, color, as_of, threshold).await? {
                    triggering.push(drop);
                }
            }
            if !triggering.is_empty() {
                drops.push(ProductDrop { product, triggering });
            }
        }
        Ok(drops)
    }

    async fn color_drop(
        &self,
        product: &Product,
        color: Color,
        as_of: NaiveDate,
        threshold: f64,
    ) -> StoreResult<Option<ColorDrop>> {
        let recent = self
            .store
            .recent_prices_until(TraceOwner::Color(color.id), as_of, 2)
            .await?;
        let [current, previous] = recent.as_slice() else {
            info!(product = %product.name, color = %color.name, "only one price tracked, ignoring");
            return Ok(None);
        };
        let (current, previous) = (current.price, previous.price);

        let Some(percent) = drop_percent(previous, current) else {
            info!(
                product = %product.name,
                color = %color.name,
                previous = %format_minor_units(previous),
                current = %format_minor_units(current),
                "price did not drop, ignoring"
            );
            return Ok(None);
        };

        let qualifies = percent >= threshold;
        info!(
            product = %product.name,
            color = %color.name,
            previous = %format_minor_units(previous),
            current = %format_minor_units(current),
            drop_percent = percent,
            qualifies,
            "price dropped"
        );
        Ok(qualifies.then(|| ColorDrop {
            color,
            previous,
            current,
            drop_percent: percent,
        }))
    }
}
