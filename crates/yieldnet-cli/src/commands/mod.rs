//! CLI Command Implementations

pub mod config;
pub mod demo;
pub mod show;
pub mod sweep;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use yieldnet_core::store::FileRequestStore;
use yieldnet_core::{MinerId, MinerScore};

/// Open the file-backed request store rooted at `dir`, creating it if needed.
pub fn open_store(dir: &Path) -> Result<Arc<FileRequestStore>> {
    let store = FileRequestStore::new(dir)
        .with_context(|| format!("opening request store at {}", dir.display()))?;
    Ok(Arc::new(store))
}

/// Scores sorted by final score descending, ties broken by miner id.
pub fn ranked(scores: &BTreeMap<MinerId, MinerScore>) -> Vec<(&MinerId, &MinerScore)> {
    let mut rows: Vec<_> = scores.iter().collect();
    rows.sort_by(|a, b| {
        b.1.final_score
            .total_cmp(&a.1.final_score)
            .then_with(|| a.0.cmp(b.0))
    });
    rows
}
