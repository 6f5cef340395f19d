use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::scan::PendingUpdate;
use crate::catalog::{CatalogItem, CatalogStore};
use crate::error::SyncError;
use crate::progress::ProgressReporter;

/// Updates persisted per catalog call.
pub const PERSIST_CHUNK_SIZE: usize = 500;

/// Writes staged updates grouped by parent, `PERSIST_CHUNK_SIZE` at a time.
///
/// Each chunk is applied to the items in memory and then handed to the store
/// in one call. A failed or cancelled call reverts that chunk's items before
/// the error is returned; chunks persisted earlier stay as they are. `saved`
/// counts persisted updates and stays accurate when this returns an error.
pub async fn persist_updates(
    store: &dyn CatalogStore,
    updates: Vec<PendingUpdate<'_>>,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<'_>,
    saved: &mut usize,
) -> Result<(), SyncError> {
    let total = updates.len();
    // Deterministic order for predictable batching.
    let mut groups: BTreeMap<String, Vec<PendingUpdate<'_>>> = BTreeMap::new();
    for update in updates {
        groups
            .entry(update.parent_key.clone())
            .or_default()
            .push(update);
    }

    for (parent_key, mut group) in groups {
        for chunk in group.chunks_mut(PERSIST_CHUNK_SIZE) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            for update in chunk.iter_mut() {
                update.item.community_rating = Some(update.new_rating);
            }

            let batch: Vec<&CatalogItem> = chunk.iter().map(|u| &*u.item).collect();
            let result = store.persist_batch(&parent_key, &batch, cancel).await;

            if let Err(source) = result {
                for update in chunk.iter_mut() {
                    update.item.community_rating = update.old_rating;
                }
                warn!(
                    parent_key = %parent_key,
                    batch_len = chunk.len(),
                    saved = *saved,
                    error = %source,
                    "catalog batch failed; reverted in-memory ratings"
                );
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                return Err(SyncError::Persistence {
                    parent_key,
                    batch_len: chunk.len(),
                    source,
                });
            }

            *saved += chunk.len();
            debug!(parent_key = %parent_key, batch_len = chunk.len(), saved = *saved, "catalog batch saved");
            progress.report_phase(90.0, 10.0, *saved, total);
        }
    }
    Ok(())
}
