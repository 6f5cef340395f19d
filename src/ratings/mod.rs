//! IMDb ratings dataset: on-disk cache and streaming parser.

pub mod cache;
pub mod filter;
pub mod parser;

use std::collections::HashMap;

use serde::Serialize;

/// Header line of `title.ratings.tsv`.
pub const EXPECTED_HEADER: &str = "tconst\taverageRating\tnumVotes";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingRecord {
    pub rating: f32,
    pub votes: u32,
}

/// Identifier -> record. Built once per run and never mutated after the parse returns.
pub type RatingsTable = HashMap<String, RatingRecord>;
