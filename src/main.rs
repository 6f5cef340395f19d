use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use imdb_ratings_sync::catalog::postgres::PgCatalog;
use imdb_ratings_sync::progress::LogProgress;
use imdb_ratings_sync::ratings::cache::RatingsCache;
use imdb_ratings_sync::ratings::filter::IdFilter;
use imdb_ratings_sync::ratings::parser::{ParseLimits, RatingsParser};
use imdb_ratings_sync::reconcile::run_sync;
use imdb_ratings_sync::scheduler::{run_daily, DailyTrigger};
use imdb_ratings_sync::util::db::Db;
use imdb_ratings_sync::util::env;
use imdb_ratings_sync::SyncConfig;

#[derive(Parser, Debug)]
#[command(name = "imdb-sync", version, about = "Sync IMDb community ratings into the catalog")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run one sync now and print the JSON summary
    Run(RunArgs),
    /// Run a sync every day at a fixed local time until Ctrl+C
    Daemon {
        /// Local trigger time as HH:MM (defaults to SYNC_DAILY_AT, then 03:00)
        #[arg(long)]
        at: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Validate a local title.ratings.tsv and print parse statistics
    Parse {
        path: PathBuf,
        /// Only keep these identifiers (repeatable); their ratings are printed
        #[arg(long = "id")]
        ids: Vec<String>,
        /// Override the truncation threshold (default 500000)
        #[arg(long)]
        min_rows: Option<u64>,
    },
    /// Inspect or manage the on-disk dataset cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Print path, size and age of the cached dataset
    Status,
    /// Delete the cached dataset
    Clear,
    /// Download the dataset unless the cache is fresh
    Fetch {
        /// Download even when the cache is fresh
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Minimum IMDb vote count (clamped to 1..=1000000)
    #[arg(long)]
    min_votes: Option<i64>,
    /// Scan and stage updates without writing them
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long, default_value_t = false)]
    no_movies: bool,
    #[arg(long, default_value_t = false)]
    no_series: bool,
    /// Log every item decision
    #[arg(long, default_value_t = false)]
    verbose_items: bool,
    /// Optional override for the catalog database URL
    #[arg(long)]
    db_url: Option<String>,
    #[arg(long, default_value_t = 4)]
    max_connections: u32,
}

impl RunArgs {
    fn config(&self) -> SyncConfig {
        let mut cfg = SyncConfig::from_env();
        if let Some(n) = self.min_votes {
            cfg = cfg.with_min_votes(n);
        }
        cfg.dry_run |= self.dry_run;
        cfg.include_movies &= !self.no_movies;
        cfg.include_series &= !self.no_series;
        cfg.verbose_item_logging |= self.verbose_items;
        cfg
    }

    async fn catalog(&self) -> Result<PgCatalog> {
        let url = match &self.db_url {
            Some(url) => url.clone(),
            None => env::db_url()?,
        };
        let db = Db::connect(&url, self.max_connections)
            .await
            .context("connect to catalog database")?;
        Ok(PgCatalog::new(db))
    }
}

/// Cancels `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown: Ctrl+C received");
            token.cancel();
        }
    });
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    imdb_ratings_sync::tracing::init_tracing("info,sqlx=warn")?;
    env::bootstrap_cli("imdb-sync");
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let cfg = args.config();
            let catalog = args.catalog().await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            match run_sync(&cfg, &catalog, &LogProgress, &cancel).await {
                Ok(summary) => print_json(&summary)?,
                Err(failure) => {
                    print_json(&failure.partial)?;
                    return Err(failure.into());
                }
            }
        }
        Commands::Daemon { at, run } => {
            let trigger = match at {
                Some(raw) => raw.parse::<DailyTrigger>()?,
                None => DailyTrigger::from_env(),
            };
            let cfg = run.config();
            let catalog = run.catalog().await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            info!(at = %trigger.at(), "daemon started; press Ctrl+C to stop");

            let (cfg, catalog, token) = (&cfg, &catalog, &cancel);
            run_daily(trigger, &cancel, move || async move {
                match run_sync(cfg, catalog, &LogProgress, token).await {
                    Ok(summary) => match serde_json::to_string(&summary) {
                        Ok(line) => info!(summary = %line, "scheduled sync complete"),
                        Err(e) => warn!(error = %e, "failed to encode sync summary"),
                    },
                    Err(failure) => error!(
                        category = failure.error.category(),
                        updated = failure.partial.updated,
                        error = %failure.error,
                        "scheduled sync failed"
                    ),
                }
            })
            .await;
            info!("daemon stopped");
        }
        Commands::Parse {
            path,
            ids,
            min_rows,
        } => {
            let mut limits = ParseLimits::default();
            if let Some(n) = min_rows {
                limits.min_rows = n;
            }
            let filter = (!ids.is_empty()).then(|| IdFilter::literal(ids));
            let mut parser = RatingsParser::new(limits);
            if let Some(filter) = &filter {
                parser = parser.with_filter(filter);
            }
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let parsed = parser
                .parse_path(&path, &cancel)
                .await
                .with_context(|| format!("parse {}", path.display()))?;
            let ratings: BTreeMap<_, _> = match filter {
                Some(_) => parsed.table.into_iter().collect(),
                None => BTreeMap::new(),
            };
            print_json(&json!({ "stats": parsed.stats, "ratings": ratings }))?;
        }
        Commands::Cache { action } => {
            let cfg = SyncConfig::from_env();
            let cache = RatingsCache::new(&cfg.cache)?;
            match action {
                CacheAction::Status => print_json(&cache.status())?,
                CacheAction::Clear => {
                    let deleted = cache.invalidate().await?;
                    print_json(&json!({ "deleted": deleted }))?;
                }
                CacheAction::Fetch { force } => {
                    let cancel = CancellationToken::new();
                    cancel_on_ctrl_c(cancel.clone());
                    if force {
                        cache.refresh(&cancel).await.context("refresh ratings cache")?;
                    } else {
                        cache
                            .acquire_local_path(&cancel)
                            .await
                            .context("acquire ratings cache")?;
                    }
                    print_json(&cache.status())?;
                }
            }
        }
    }
    Ok(())
}
