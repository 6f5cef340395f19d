//! On-disk cache of the decompressed ratings dataset.
//!
//! The canonical file is only ever replaced by an atomic rename of a fully
//! decompressed and fsynced temp file, so readers never see a partial write.

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::write::GzDecoder;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheSettings;
use crate::error::{SyncError, ValidationError};

pub const CACHE_DIR_NAME: &str = "imdb-ratings-cache";
pub const CACHE_FILE_NAME: &str = "title.ratings.tsv";

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: Option<u64>,
    pub age_secs: Option<u64>,
    pub fresh: bool,
}

pub struct RatingsCache {
    http: Client,
    source_url: String,
    cache_path: PathBuf,
    temp_path: PathBuf,
    freshness: Duration,
    max_decompressed_bytes: u64,
}

impl RatingsCache {
    pub fn new(settings: &CacheSettings) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        let dir = settings.data_root.join(CACHE_DIR_NAME);
        let cache_path = dir.join(CACHE_FILE_NAME);
        let temp_path = dir.join(format!("{CACHE_FILE_NAME}.tmp"));
        Ok(Self {
            http,
            source_url: settings.source_url.clone(),
            cache_path,
            temp_path,
            freshness: settings.freshness,
            max_decompressed_bytes: settings.max_decompressed_bytes,
        })
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn has_cache(&self) -> bool {
        self.cache_path.is_file()
    }

    /// `None` when there is no cache file. A modification time in the future counts as age zero.
    fn cache_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.cache_path).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    pub fn status(&self) -> CacheStatus {
        let size_bytes = std::fs::metadata(&self.cache_path).ok().map(|m| m.len());
        let age = self.cache_age();
        CacheStatus {
            path: self.cache_path.clone(),
            exists: size_bytes.is_some(),
            size_bytes,
            age_secs: age.map(|a| a.as_secs()),
            fresh: age.is_some_and(|a| a < self.freshness),
        }
    }

    /// Path to a decompressed snapshot no older than the freshness window,
    /// downloading one first if needed.
    #[instrument(skip_all)]
    pub async fn acquire_local_path(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, SyncError> {
        match self.cache_age() {
            Some(age) if age < self.freshness => {
                debug!(age_secs = age.as_secs(), "using cached ratings dataset");
                return Ok(self.cache_path.clone());
            }
            Some(age) => info!(
                age_hours = age.as_secs() / 3600,
                "cached ratings dataset is stale; refreshing"
            ),
            None => info!("no cached ratings dataset; downloading"),
        }
        self.refresh(cancel).await?;
        Ok(self.cache_path.clone())
    }

    /// Download and replace the cache regardless of its age.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(dir) = self.cache_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SyncError::io(dir, e))?;
        }

        let written = match self.download_into_temp(cancel).await {
            Ok(written) => written,
            Err(err) => {
                self.discard_temp().await;
                return Err(err);
            }
        };

        if let Err(e) = tokio::fs::rename(&self.temp_path, &self.cache_path).await {
            self.discard_temp().await;
            return Err(SyncError::io(&self.cache_path, e));
        }
        info!(
            bytes = written,
            path = %self.cache_path.display(),
            "ratings cache replaced"
        );
        Ok(())
    }

    async fn download_into_temp(&self, cancel: &CancellationToken) -> Result<u64, SyncError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            resp = self.http.get(&self.source_url).send() => resp?,
        };
        let response = response.error_for_status()?;

        let file = std::fs::File::create(&self.temp_path)
            .map_err(|e| SyncError::io(&self.temp_path, e))?;
        let sink = CappedWriter::new(BufWriter::new(file), self.max_decompressed_bytes);
        let mut decoder = GzDecoder::new(sink);
        let mut body = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            if let Err(e) = decoder.write_all(&chunk) {
                let exceeded = decoder.get_ref().exceeded;
                return Err(classify_write_error(
                    exceeded,
                    self.max_decompressed_bytes,
                    &self.temp_path,
                    e,
                ));
            }
        }

        // Flushing the decoder tail and fsyncing block, so keep them off the async workers.
        let limit = self.max_decompressed_bytes;
        let temp_path = self.temp_path.clone();
        tokio::task::spawn_blocking(move || finish_temp_file(decoder, limit, &temp_path))
            .await
            .map_err(|e| SyncError::io(&self.temp_path, io::Error::other(e)))?
    }

    /// Best-effort removal of a half-written temp file.
    async fn discard_temp(&self) {
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => debug!(path = %self.temp_path.display(), "removed partial download"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.temp_path.display(),
                error = %e,
                "failed to remove partial download"
            ),
        }
    }

    /// Removes the cached file and any leftover temp file. Returns whether anything was deleted.
    pub async fn invalidate(&self) -> Result<bool, SyncError> {
        let mut deleted = false;
        for path in [&self.cache_path, &self.temp_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    info!(path = %path.display(), "removed cached ratings file");
                    deleted = true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(SyncError::io(path, e)),
            }
        }
        Ok(deleted)
    }
}

type TempDecoder = GzDecoder<CappedWriter<BufWriter<std::fs::File>>>;

/// Completes the gzip stream, checks its trailer and fsyncs the temp file.
/// Returns the decompressed size.
fn finish_temp_file(
    mut decoder: TempDecoder,
    limit: u64,
    temp_path: &Path,
) -> Result<u64, SyncError> {
    if let Err(e) = decoder.try_finish() {
        let exceeded = decoder.get_ref().exceeded;
        return Err(classify_write_error(exceeded, limit, temp_path, e));
    }
    let sink = decoder
        .finish()
        .map_err(|e| classify_write_error(false, limit, temp_path, e))?;
    let written = sink.written;
    let file = sink
        .inner
        .into_inner()
        .map_err(|e| SyncError::io(temp_path, e.into_error()))?;
    file.sync_all().map_err(|e| SyncError::io(temp_path, e))?;
    Ok(written)
}

fn classify_write_error(
    exceeded: bool,
    limit: u64,
    temp_path: &Path,
    err: io::Error,
) -> SyncError {
    if exceeded {
        return SyncError::SizeLimitExceeded { limit };
    }
    match err.kind() {
        io::ErrorKind::InvalidInput
        | io::ErrorKind::InvalidData
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WriteZero => {
            ValidationError::MalformedCompressedStream(err.to_string()).into()
        }
        _ => SyncError::io(temp_path, err),
    }
}

/// Refuses writes past `limit` bytes and remembers that it did.
struct CappedWriter<W> {
    inner: W,
    written: u64,
    limit: u64,
    exceeded: bool,
}

impl<W> CappedWriter<W> {
    fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            written: 0,
            limit,
            exceeded: false,
        }
    }
}

impl<W: Write> Write for CappedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.limit {
            self.exceeded = true;
            return Err(io::Error::other("decompressed size cap exceeded"));
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
