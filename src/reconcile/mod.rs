//! Reconciliation engine: matches catalog items against the ratings table and
//! persists the changes in rollback-safe batches.

pub mod acquire;
pub mod persist;
pub mod scan;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::ratings::cache::RatingsCache;
use crate::ratings::filter::IdFilter;
use crate::ratings::parser::ParseStats;
use crate::ratings::RatingsTable;

pub use scan::ScanCounts;

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counts: ScanCounts,
    pub staged: usize,
    pub updated: usize,
    pub parse: Option<ParseStats>,
    pub stale_cache_used: bool,
    pub dry_run: bool,
}

impl SyncSummary {
    fn start(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            counts: ScanCounts::default(),
            staged: 0,
            updated: 0,
            parse: None,
            stale_cache_used: false,
            dry_run,
        }
    }
}

/// A failed run together with what it got done before failing.
#[derive(Debug, Error)]
#[error("ratings sync failed ({}) after {} updates", .error.category(), .partial.updated)]
pub struct RunFailure {
    #[source]
    pub error: SyncError,
    pub partial: SyncSummary,
}

/// One complete sync: build the filter, load the table, scan, persist.
///
/// Reports 0, 5, 30, the scan (30-90) and persist (90-100) phases, and 100 on
/// success. Batches persisted before a failure or cancellation stay persisted.
pub async fn run_sync(
    cfg: &SyncConfig,
    store: &dyn CatalogStore,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<SyncSummary, RunFailure> {
    let mut summary = SyncSummary::start(cfg.dry_run);
    let span = info_span!("ratings_sync", run_id = %summary.run_id, dry_run = cfg.dry_run);
    let result = execute(cfg, store, progress, cancel, &mut summary)
        .instrument(span)
        .await;
    summary.finished_at = Utc::now();

    match result {
        Ok(()) => {
            info!(
                run_id = %summary.run_id,
                scanned = summary.counts.items_scanned,
                staged = summary.staged,
                updated = summary.updated,
                stale_cache_used = summary.stale_cache_used,
                "ratings sync finished"
            );
            Ok(summary)
        }
        Err(err) => {
            error!(
                run_id = %summary.run_id,
                category = err.category(),
                updated = summary.updated,
                error = %err,
                "ratings sync failed"
            );
            Err(RunFailure {
                error: err,
                partial: summary,
            })
        }
    }
}

async fn execute(
    cfg: &SyncConfig,
    store: &dyn CatalogStore,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
    summary: &mut SyncSummary,
) -> Result<(), SyncError> {
    let mut progress = ProgressReporter::new(sink);
    progress.report(0.0);
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let kinds = cfg.item_kinds();
    let mut items = if kinds.is_empty() {
        info!("no item kinds enabled; nothing to reconcile");
        Vec::new()
    } else {
        store
            .list_rated_items(&kinds)
            .await
            .map_err(SyncError::Catalog)?
    };

    let filter = IdFilter::numeric(
        items
            .iter()
            .filter_map(|item| item.imdb_id.as_deref())
            .filter(|id| !id.is_empty()),
    );
    info!(items = items.len(), identifiers = filter.len(), "catalog enumerated");
    progress.report(5.0);

    let table = if filter.is_empty() {
        info!("no identifiers to look up; skipping dataset download");
        RatingsTable::new()
    } else {
        let cache = RatingsCache::new(&cfg.cache)?;
        let loaded = acquire::load_ratings(&cache, &filter, cfg, cancel).await?;
        summary.parse = Some(loaded.parsed.stats);
        summary.stale_cache_used = loaded.stale_cache_used;
        loaded.parsed.table
    };
    progress.report(30.0);

    let (updates, counts) = scan::scan_items(&mut items, &table, cfg, &mut progress);
    summary.counts = counts;
    summary.staged = updates.len();

    if cfg.dry_run {
        info!(staged = summary.staged, "dry run; skipping persistence");
    } else {
        persist::persist_updates(store, updates, cancel, &mut progress, &mut summary.updated)
            .await?;
    }

    progress.finish();
    Ok(())
}
