use std::path::PathBuf;

use thiserror::Error;

/// File-level reasons for rejecting a ratings dataset.
///
/// Row-level problems never show up here; they are counted in
/// [`crate::ratings::parser::ParseStats`] and only surface through
/// [`ValidationError::Corrupt`] once they cross the error-ratio threshold.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid or missing header (expected {expected:?})")]
    InvalidHeader { expected: &'static str },
    #[error("no valid data rows ({total_rows} rows, {parse_errors} parse errors)")]
    NoValidRows { total_rows: u64, parse_errors: u64 },
    #[error("dataset appears truncated: {valid_rows} valid rows, expected at least {min_rows}")]
    Truncated { valid_rows: u64, min_rows: u64 },
    #[error(
        "dataset appears corrupt: {parse_errors} of {total_rows} rows failed to parse (max ratio {max_ratio})"
    )]
    Corrupt {
        parse_errors: u64,
        total_rows: u64,
        max_ratio: f64,
    },
    #[error("malformed compressed stream: {0}")]
    MalformedCompressedStream(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error fetching ratings dataset: {0}")]
    Network(#[from] reqwest::Error),
    #[error("decompressed dataset exceeds the {limit} byte safety cap")]
    SizeLimitExceeded { limit: u64 },
    #[error("ratings dataset failed validation: {0}")]
    DataValidation(#[from] ValidationError),
    #[error("failed to persist batch of {batch_len} items under {parent_key}")]
    Persistence {
        parent_key: String,
        batch_len: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("catalog query failed")]
    Catalog(#[source] anyhow::Error),
    #[error("i/o error at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Network hiccups are worth one immediate retry; everything else either
    /// needs invalidation first or will not change on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::DataValidation(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Network(_) => "network",
            SyncError::SizeLimitExceeded { .. } => "size_limit",
            SyncError::DataValidation(_) => "data_validation",
            SyncError::Persistence { .. } => "persistence",
            SyncError::Catalog(_) => "catalog",
            SyncError::Io { .. } => "io",
            SyncError::Cancelled => "cancelled",
        }
    }
}
