//! `CatalogStore` over a Postgres `catalog_items` table:
//!
//! ```sql
//! CREATE TABLE catalog_items (
//!     id               uuid PRIMARY KEY,
//!     name             text NOT NULL,
//!     kind             text NOT NULL,          -- 'movie' | 'series'
//!     imdb_id          text,
//!     community_rating real,
//!     parent_key       text NOT NULL,
//!     is_virtual       boolean NOT NULL DEFAULT false
//! );
//! ```

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{CatalogItem, CatalogStore, ItemKind};
use crate::util::db::Db;

pub struct PgCatalog {
    db: Db,
}

impl PgCatalog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn parse_kind(raw: &str) -> Result<ItemKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "movie" => Ok(ItemKind::Movie),
        "series" => Ok(ItemKind::Series),
        other => Err(anyhow!("unknown catalog item kind {other:?}")),
    }
}

fn row_to_item(row: PgRow) -> Result<CatalogItem> {
    let kind: String = row.try_get("kind")?;
    Ok(CatalogItem {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: parse_kind(&kind)?,
        imdb_id: row.try_get("imdb_id")?,
        community_rating: row.try_get("community_rating")?,
        parent_key: row.try_get("parent_key")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalog {
    #[instrument(skip(self))]
    async fn list_rated_items(&self, kinds: &[ItemKind]) -> Result<Vec<CatalogItem>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
        let rows = sqlx::query(
            "SELECT id, name, kind, imdb_id, community_rating, parent_key \
               FROM catalog_items \
              WHERE imdb_id IS NOT NULL AND imdb_id <> '' \
                AND NOT is_virtual \
                AND kind = ANY($1::text[])",
        )
        .persistent(false)
        .bind(&kinds)
        .fetch_all(&self.db.pool)
        .await
        .context("list catalog items with imdb ids")?;
        rows.into_iter().map(row_to_item).collect()
    }

    async fn persist_batch(
        &self,
        parent_key: &str,
        items: &[&CatalogItem],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<Uuid> = Vec::with_capacity(items.len());
        let mut ratings: Vec<f32> = Vec::with_capacity(items.len());
        for item in items {
            let Some(rating) = item.community_rating else {
                bail!("item {} has no rating to persist", item.id);
            };
            ids.push(item.id);
            ratings.push(rating);
        }

        let mut tx = self.db.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE catalog_items AS c \
                SET community_rating = d.rating \
               FROM unnest($1::uuid[], $2::real[]) AS d(id, rating) \
              WHERE c.id = d.id AND c.parent_key = $3",
        )
        .persistent(false)
        .bind(&ids)
        .bind(&ratings)
        .bind(parent_key)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("update ratings under {parent_key}"))?;

        // Dropping `tx` without commit rolls the batch back.
        if result.rows_affected() != ids.len() as u64 {
            bail!(
                "expected to update {} rows under {parent_key}, updated {}",
                ids.len(),
                result.rows_affected()
            );
        }
        if cancel.is_cancelled() {
            bail!("cancelled before commit");
        }
        tx.commit().await?;
        debug!(parent_key, rows = ids.len(), "catalog batch committed");
        Ok(())
    }
}
