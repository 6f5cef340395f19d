use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::ratings::cache::RatingsCache;
use crate::ratings::filter::IdFilter;
use crate::ratings::parser::{ParsedRatings, RatingsParser};

#[derive(Debug)]
pub struct LoadedRatings {
    pub parsed: ParsedRatings,
    /// The download failed and an out-of-date cache file was parsed instead.
    pub stale_cache_used: bool,
}

/// Acquires and parses the dataset. A validation failure (bad gzip, header,
/// truncation, corruption) invalidates the cache and repeats the whole
/// sequence once; a second validation failure is returned unchanged.
#[instrument(skip_all, fields(requested = filter.len()))]
pub async fn load_ratings(
    cache: &RatingsCache,
    filter: &IdFilter,
    cfg: &SyncConfig,
    cancel: &CancellationToken,
) -> Result<LoadedRatings, SyncError> {
    let parser = RatingsParser::new(cfg.limits).with_filter(filter);
    let mut invalidated = false;
    loop {
        let err = match acquire_and_parse(cache, &parser, cfg.retry_delay, cancel).await {
            Ok(loaded) => return Ok(loaded),
            Err(err) => err,
        };
        if !err.is_validation() || invalidated {
            return Err(err);
        }
        warn!(error = %err, "ratings dataset failed validation; invalidating cache and retrying once");
        cache.invalidate().await?;
        invalidated = true;
    }
}

async fn acquire_and_parse(
    cache: &RatingsCache,
    parser: &RatingsParser<'_>,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<LoadedRatings, SyncError> {
    let (path, stale_cache_used) = acquire_with_fallback(cache, retry_delay, cancel).await?;
    let parsed = parser.parse_path(&path, cancel).await?;
    Ok(LoadedRatings {
        parsed,
        stale_cache_used,
    })
}

/// Returns the local dataset path and whether it is a stale fallback.
///
/// A transient failure is retried once after `retry_delay`. If the retry is
/// transient too, an existing cache file is used regardless of age.
pub async fn acquire_with_fallback(
    cache: &RatingsCache,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<(PathBuf, bool), SyncError> {
    match cache.acquire_local_path(cancel).await {
        Ok(path) => return Ok((path, false)),
        Err(err) if err.is_transient() => warn!(
            error = %err,
            retry_in_secs = retry_delay.as_secs_f64(),
            "ratings download failed; retrying"
        ),
        Err(err) => return Err(err),
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        _ = tokio::time::sleep(retry_delay) => {}
    }

    match cache.acquire_local_path(cancel).await {
        Ok(path) => {
            info!("ratings download succeeded on retry");
            Ok((path, false))
        }
        Err(err) if err.is_transient() && cache.has_cache() => {
            warn!(
                error = %err,
                path = %cache.cache_path().display(),
                "ratings download failed twice; using stale cached dataset"
            );
            Ok((cache.cache_path().to_path_buf(), true))
        }
        Err(err) => Err(err),
    }
}
