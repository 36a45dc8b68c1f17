//! `yieldnet show` command implementation

use anyhow::Result;
use std::path::PathBuf;

use yieldnet_core::store::RequestStore;
use yieldnet_core::RequestId;

use super::{open_store, ranked};

pub fn run(id: String, store_dir: PathBuf, format: String) -> Result<()> {
    let store = open_store(&store_dir)?;
    let record = store.load(&RequestId::new(id))?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let flagged = record
        .submissions
        .values()
        .filter(|s| !s.flag.is_ok())
        .count();

    println!("📋 Request {}", record.request.id);
    println!("   Type: {}", record.request.request_type);
    println!("   State: {}", record.state);
    println!(
        "   Pools: {}, total assets {}",
        record.request.pools.len(),
        record.request.total_assets
    );
    println!(
        "   Miners: {} dispatched, {} answered ({} flagged)",
        record.miners.len(),
        record.submissions.len(),
        flagged
    );
    if let Some(frozen_at) = record.frozen_at {
        println!("   Frozen at: {frozen_at}");
    }
    if let Some(end) = record.scoring_period_end {
        println!("   Scoring due: {end}");
    }
    if let Some(scored_at) = record.scored_at {
        println!("   Scored at: {scored_at}");
    }
    if let Some(fault) = &record.fault {
        println!("   ⚠️ Fault: {fault}");
    }
    if !record.scores.is_empty() {
        println!();
        for (miner, score) in ranked(&record.scores) {
            println!(
                "   {:<16} final {:.4}  yield {:+.6}  latency {:.2}s  penalty x{:.2}",
                miner.as_str(),
                score.final_score,
                score.yield_value,
                score.latency_seconds,
                score.similarity_penalty
            );
        }
    }
    Ok(())
}
