//! Catalog capability consumed by the reconciliation engine.
//!
//! The engine only depends on [`CatalogStore`]; concrete storage lives in
//! adapters such as [`postgres::PgCatalog`].

pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Movie,
    Series,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Movie => "movie",
            ItemKind::Series => "series",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub id: Uuid,
    pub name: String,
    pub kind: ItemKind,
    pub imdb_id: Option<String>,
    pub community_rating: Option<f32>,
    /// Items are persisted in batches that share this key.
    pub parent_key: String,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Non-virtual items of the given kinds that carry an IMDb identifier.
    async fn list_rated_items(&self, kinds: &[ItemKind]) -> anyhow::Result<Vec<CatalogItem>>;

    /// Persist the current rating of every item in `items`. The batch succeeds
    /// or fails as a whole.
    async fn persist_batch(
        &self,
        parent_key: &str,
        items: &[&CatalogItem],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}
