use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::CatalogItem;
use crate::config::SyncConfig;
use crate::progress::ProgressReporter;
use crate::ratings::{RatingRecord, RatingsTable};

/// Ratings closer than this are treated as equal.
pub const RATING_EPSILON: f32 = 0.01;
/// Per-category cap on debug samples when verbose item logging is off.
const MAX_LOGGED_SAMPLES: usize = 10;

/// A staged rating change. The item is only touched once its batch is persisted.
#[derive(Debug)]
pub struct PendingUpdate<'a> {
    pub parent_key: String,
    pub old_rating: Option<f32>,
    pub new_rating: f32,
    pub item: &'a mut CatalogItem,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScanCounts {
    pub items_scanned: usize,
    pub skipped_missing_id: usize,
    pub not_found: usize,
    pub skipped_below_min_votes: usize,
    pub skipped_unchanged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Decision {
    MissingId,
    NotFound,
    BelowMinVotes(RatingRecord),
    Unchanged(RatingRecord),
    Update(RatingRecord),
}

fn classify(item: &CatalogItem, table: &RatingsTable, min_votes: u32) -> Decision {
    let Some(imdb_id) = item.imdb_id.as_deref().filter(|id| !id.is_empty()) else {
        return Decision::MissingId;
    };
    let Some(record) = table.get(imdb_id).copied() else {
        return Decision::NotFound;
    };
    if record.votes < min_votes {
        return Decision::BelowMinVotes(record);
    }
    match item.community_rating {
        Some(current) if (record.rating - current).abs() < RATING_EPSILON => {
            Decision::Unchanged(record)
        }
        _ => Decision::Update(record),
    }
}

#[derive(Debug, Clone, Copy)]
enum Sampled {
    NotFound = 0,
    BelowMinVotes = 1,
}

/// Caps debug samples per skip category unless verbose item logging is on.
struct Sampler {
    verbose: bool,
    logged: [usize; 2],
}

impl Sampler {
    fn new(verbose: bool) -> Self {
        Self {
            verbose,
            logged: [0; 2],
        }
    }

    fn take(&mut self, category: Sampled) -> bool {
        if self.verbose {
            return true;
        }
        let logged = &mut self.logged[category as usize];
        if *logged < MAX_LOGGED_SAMPLES {
            *logged += 1;
            return true;
        }
        false
    }
}

/// Applies the skip policy to every item, in order: missing id, not in the
/// table, too few votes, unchanged. Everything else is staged.
pub fn scan_items<'a>(
    items: &'a mut [CatalogItem],
    table: &RatingsTable,
    cfg: &SyncConfig,
    progress: &mut ProgressReporter<'_>,
) -> (Vec<PendingUpdate<'a>>, ScanCounts) {
    let total = items.len();
    let min_votes = cfg.min_votes();
    let mut counts = ScanCounts::default();
    let mut updates = Vec::new();
    let mut sampler = Sampler::new(cfg.verbose_item_logging);

    for (idx, item) in items.iter_mut().enumerate() {
        counts.items_scanned += 1;
        match classify(item, table, min_votes) {
            Decision::MissingId => {
                counts.skipped_missing_id += 1;
                if sampler.verbose {
                    debug!(item = %item.name, "skipped: no imdb id");
                }
            }
            Decision::NotFound => {
                counts.not_found += 1;
                if sampler.take(Sampled::NotFound) {
                    debug!(
                        item = %item.name,
                        imdb_id = item.imdb_id.as_deref().unwrap_or_default(),
                        "no rating in dataset"
                    );
                }
            }
            Decision::BelowMinVotes(record) => {
                counts.skipped_below_min_votes += 1;
                if sampler.take(Sampled::BelowMinVotes) {
                    debug!(
                        item = %item.name,
                        votes = record.votes,
                        min_votes,
                        "skipped: below minimum votes"
                    );
                }
            }
            Decision::Unchanged(record) => {
                counts.skipped_unchanged += 1;
                if sampler.verbose {
                    debug!(item = %item.name, rating = record.rating, "skipped: rating unchanged");
                }
            }
            Decision::Update(record) => {
                if sampler.verbose {
                    info!(
                        item = %item.name,
                        old = ?item.community_rating,
                        new = record.rating,
                        votes = record.votes,
                        "rating update staged"
                    );
                }
                updates.push(PendingUpdate {
                    parent_key: item.parent_key.clone(),
                    old_rating: item.community_rating,
                    new_rating: record.rating,
                    item,
                });
            }
        }
        progress.report_phase(30.0, 60.0, idx + 1, total);
    }

    info!(
        scanned = counts.items_scanned,
        staged = updates.len(),
        missing_id = counts.skipped_missing_id,
        not_found = counts.not_found,
        below_min_votes = counts.skipped_below_min_votes,
        unchanged = counts.skipped_unchanged,
        "catalog scan complete"
    );
    (updates, counts)
}
