//! Per-run configuration. Built once (usually from the environment) and passed
//! by reference to every stage of a sync run.

use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::ItemKind;
use crate::ratings::parser::ParseLimits;
use crate::util::env::{env_flag, env_opt, env_parse};

pub const DEFAULT_RATINGS_URL: &str = "https://datasets.imdbws.com/title.ratings.tsv.gz";
pub const MIN_VOTES_CEILING: u32 = 1_000_000;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub source_url: String,
    /// Cache lives under `<data_root>/imdb-ratings-cache/`.
    pub data_root: PathBuf,
    pub freshness: Duration,
    pub max_decompressed_bytes: u64,
    pub request_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_RATINGS_URL.to_string(),
            data_root: PathBuf::from("data"),
            freshness: Duration::from_secs(23 * 60 * 60),
            max_decompressed_bytes: 100 * 1024 * 1024,
            request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    min_votes: u32,
    pub include_movies: bool,
    pub include_series: bool,
    pub verbose_item_logging: bool,
    /// Scan and stage, but never call the catalog's persist.
    pub dry_run: bool,
    pub retry_delay: Duration,
    pub cache: CacheSettings,
    pub limits: ParseLimits,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_votes: 1,
            include_movies: true,
            include_series: true,
            verbose_item_logging: false,
            dry_run: false,
            retry_delay: Duration::from_secs(5),
            cache: CacheSettings::default(),
            limits: ParseLimits::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cache = CacheSettings {
            source_url: env_opt("IMDB_RATINGS_URL").unwrap_or(defaults.cache.source_url),
            data_root: env_opt("IMDB_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache.data_root),
            request_timeout: Duration::from_secs(env_parse(
                "IMDB_HTTP_TIMEOUT_SECS",
                defaults.cache.request_timeout.as_secs(),
            )),
            ..defaults.cache
        };
        Self {
            min_votes: defaults.min_votes,
            include_movies: env_flag("IMDB_INCLUDE_MOVIES", defaults.include_movies),
            include_series: env_flag("IMDB_INCLUDE_SERIES", defaults.include_series),
            verbose_item_logging: env_flag(
                "IMDB_VERBOSE_ITEM_LOGGING",
                defaults.verbose_item_logging,
            ),
            dry_run: env_flag("DRY_RUN", defaults.dry_run),
            retry_delay: Duration::from_secs(env_parse(
                "IMDB_RETRY_DELAY_SECS",
                defaults.retry_delay.as_secs(),
            )),
            cache,
            limits: defaults.limits,
        }
        .with_min_votes(env_parse("IMDB_MIN_VOTES", 1i64))
    }

    /// Clamped to `1..=1_000_000`.
    pub fn with_min_votes(mut self, min_votes: i64) -> Self {
        self.min_votes = min_votes.clamp(1, MIN_VOTES_CEILING as i64) as u32;
        self
    }

    pub fn min_votes(&self) -> u32 {
        self.min_votes
    }

    pub fn item_kinds(&self) -> Vec<ItemKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.include_movies {
            kinds.push(ItemKind::Movie);
        }
        if self.include_series {
            kinds.push(ItemKind::Series);
        }
        kinds
    }
}
