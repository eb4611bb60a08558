//! Entity resolution: external id + parent -> persistent row, created on first sight.

use chrono::Utc;
use pricewatch_core::{
    Color, ColorDefaults, ColorId, EntityKind, ExternalId, Product, ProductDefaults, ProductId,
    Size, SizeDefaults, SizeId,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::{decode_micros, Store, StoreError, StoreResult};

/// Outcome of a resolution. `was_created` is true only for the caller whose
/// insert won; concurrent losers observe the winner's row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub entity: T,
    pub was_created: bool,
}

fn require_identity(kind: EntityKind, external_id: Option<&ExternalId>) -> StoreResult<&str> {
    match external_id {
        Some(id) if !id.is_blank() => Ok(id.as_str()),
        _ => Err(StoreError::InvalidIdentity { kind }),
    }
}

impl Store {
    pub async fn resolve_product(
        &self,
        external_id: Option<&ExternalId>,
        defaults: &ProductDefaults,
    ) -> StoreResult<Resolved<Product>> {
        let external_id = require_identity(EntityKind::Product, external_id)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO products (external_id, market, name, category, description, url, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(external_id)
        .bind(&defaults.market)
        .bind(&defaults.name)
        .bind(&defaults.category)
        .bind(&defaults.description)
        .bind(&defaults.url)
        .bind(Utc::now().timestamp_micros())
        .fetch_optional(&self.pool)
        .await?;

        let entity = self
            .product_by_external_id(external_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("product {external_id} missing after upsert")))?;
        let was_created = inserted.is_some();
        if was_created {
            debug!(product_id = %entity.id, external_id, "created product");
        }
        Ok(Resolved { entity, was_created })
    }

    pub async fn resolve_color(
        &self,
        product_id: ProductId,
        external_id: Option<&ExternalId>,
        defaults: &ColorDefaults,
    ) -> StoreResult<Resolved<Color>> {
        let external_id = require_identity(EntityKind::Color, external_id)?;
        let images = serde_json::to_string(&defaults.images)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO colors (product_id, external_id, name, images)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(product_id, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(product_id.0)
        .bind(external_id)
        .bind(&defaults.name)
        .bind(images)
        .fetch_optional(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, product_id, external_id, name, images FROM colors WHERE product_id = ?1 AND external_id = ?2",
        )
        .bind(product_id.0)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        let entity = color_from_row(&row)?;
        let was_created = inserted.is_some();
        if was_created {
            debug!(color_id = %entity.id, %product_id, external_id, "created color");
        }
        Ok(Resolved { entity, was_created })
    }

    pub async fn resolve_size(
        &self,
        color_id: ColorId,
        external_id: Option<&ExternalId>,
        defaults: &SizeDefaults,
    ) -> StoreResult<Resolved<Size>> {
        let external_id = require_identity(EntityKind::Size, external_id)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO sizes (color_id, external_id, name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(color_id, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(color_id.0)
        .bind(external_id)
        .bind(&defaults.name)
        .fetch_optional(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, color_id, external_id, name FROM sizes WHERE color_id = ?1 AND external_id = ?2",
        )
        .bind(color_id.0)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        let entity = size_from_row(&row)?;
        Ok(Resolved {
            entity,
            was_created: inserted.is_some(),
        })
    }

    pub async fn product(&self, id: ProductId) -> StoreResult<Option<Product>> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id, market, name, category, description, url, created_at
              FROM products
             WHERE id = ?1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    pub async fn product_by_external_id(&self, external_id: &str) -> StoreResult<Option<Product>> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id, market, name, category, description, url, created_at
              FROM products
             WHERE external_id = ?1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    /// Colors of a product in creation order.
    pub async fn colors_of(&self, product_id: ProductId) -> StoreResult<Vec<Color>> {
        let rows = sqlx::query(
            "SELECT id, product_id, external_id, name, images FROM colors WHERE product_id = ?1 ORDER BY id",
        )
        .bind(product_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(color_from_row).collect()
    }

    pub async fn sizes_of(&self, color_id: ColorId) -> StoreResult<Vec<Size>> {
        let rows = sqlx::query("SELECT id, color_id, external_id, name FROM sizes WHERE color_id = ?1 ORDER BY id")
            .bind(color_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(size_from_row).collect()
    }

    pub async fn product_count(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn product_from_row(row: &SqliteRow) -> StoreResult<Product> {
    Ok(Product {
        id: ProductId(row.try_get("id")?),
        external_id: row.try_get("external_id")?,
        market: row.try_get("market")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        created_at: decode_micros(row.try_get("created_at")?)?,
    })
}

pub(crate) fn color_from_row(row: &SqliteRow) -> StoreResult<Color> {
    let images: String = row.try_get("images")?;
    Ok(Color {
        id: ColorId(row.try_get("id")?),
        product_id: ProductId(row.try_get("product_id")?),
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        images: serde_json::from_str(&images)?,
    })
}

fn size_from_row(row: &SqliteRow) -> StoreResult<Size> {
    Ok(Size {
        id: SizeId(row.try_get("id")?),
        color_id: ColorId(row.try_get("color_id")?),
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_core::DayBucket;
    use std::sync::Arc;
    use tempfile::tempdir;

    use crate::StoreConfig;

    fn defaults(name: &str) -> ProductDefaults {
        ProductDefaults {
            market: "WOMAN".into(),
            name: name.into(),
            category: "dresses".into(),
            description: "linen".into(),
            url: "https://shop.example/p1".into(),
        }
    }

    #[tokio::test]
    async fn resolving_twice_yields_the_same_row() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let id = ExternalId::new("348001");

        let first = store.resolve_product(Some(&id), &defaults("Dress")).await.unwrap();
        let second = store.resolve_product(Some(&id), &defaults("Renamed")).await.unwrap();

        assert!(first.was_created);
        assert!(!second.was_created);
        assert_eq!(first.entity.id, second.entity.id);
        assert_eq!(second.entity.name, "Dress", "first-seen values win");
        assert_eq!(store.product_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn color_identity_is_scoped_to_its_product() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let a = store
            .resolve_product(Some(&ExternalId::new("1")), &defaults("A"))
            .await
            .unwrap()
            .entity;
        let b = store
            .resolve_product(Some(&ExternalId::new("2")), &defaults("B"))
            .await
            .unwrap()
            .entity;
        let color_defaults = ColorDefaults {
            name: "Black".into(),
            images: vec!["one.jpg".into(), "two.jpg".into()],
        };

        let on_a = store
            .resolve_color(a.id, Some(&ExternalId::new("800")), &color_defaults)
            .await
            .unwrap();
        let on_b = store
            .resolve_color(b.id, Some(&ExternalId::new("800")), &color_defaults)
            .await
            .unwrap();

        assert!(on_a.was_created && on_b.was_created);
        assert_ne!(on_a.entity.id, on_b.entity.id);
        assert_eq!(on_a.entity.images, vec!["one.jpg", "two.jpg"]);
        assert_eq!(store.colors_of(a.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_or_blank_identity_is_rejected() {
        let store = Store::open_in_memory(DayBucket::utc()).await.unwrap();
        let err = store.resolve_product(None, &defaults("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentity { kind: EntityKind::Product }));

        let product = store
            .resolve_product(Some(&ExternalId::new("9")), &defaults("x"))
            .await
            .unwrap()
            .entity;
        let err = store
            .resolve_color(product.id, Some(&ExternalId::new("  ")), &ColorDefaults::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentity { kind: EntityKind::Color }));
    }

    #[tokio::test]
    async fn concurrent_resolution_creates_one_row() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("race.db").display());
        let store = Arc::new(Store::open(&StoreConfig::new(url, DayBucket::utc())).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .resolve_product(Some(&ExternalId::new("race")), &defaults("Race"))
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let resolved = handle.await.unwrap();
            created += usize::from(resolved.was_created);
            ids.push(resolved.entity.id);
        }

        assert_eq!(created, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.product_count().await.unwrap(), 1);
    }
}
