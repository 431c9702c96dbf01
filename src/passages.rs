// Built-in text passage corpus and store seeding.
//
// The corpus ships embedded in the binary so a fresh server is playable
// without any data files on disk. Seeding is idempotent: passages already
// present in the store (matched by content) are left untouched.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::model::Difficulty;
use crate::store::Store;

/// Embedded default corpus, three difficulty tiers.
const DEFAULT_PASSAGES: &str = include_str!("../data/passages.json");

/// One corpus entry as it appears in the seed file. Length is derived at
/// insert time from the content.
#[derive(Debug, Clone, Deserialize)]
pub struct PassageSeed {
    pub content: String,
    pub difficulty: Difficulty,
}

/// Parse the embedded corpus.
pub fn defaults() -> Result<Vec<PassageSeed>> {
    serde_json::from_str(DEFAULT_PASSAGES).context("failed to parse embedded passage corpus")
}

/// Seed the store with the embedded corpus. Returns the number of passages
/// newly inserted (zero on every run after the first).
pub fn seed_defaults(store: &Store) -> Result<usize> {
    let seeds: Vec<(String, Difficulty)> = defaults()?
        .into_iter()
        .map(|seed| (seed.content, seed.difficulty))
        .collect();
    let inserted = store.seed_passages(&seeds)?;
    if inserted > 0 {
        info!("Seeded {} passages into the store", inserted);
    }
    Ok(inserted)
}
