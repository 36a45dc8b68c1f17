//! `yieldnet demo` command implementation

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use yieldnet_core::config::EngineConfig;
use yieldnet_core::gen;
use yieldnet_core::metrics::EngineMetrics;
use yieldnet_core::store::{MemoryRequestStore, RequestStore};
use yieldnet_core::{now_ms, MinerId, RequestId};
use yieldnet_service::{
    dispatch_request, MemoryWeightSink, MinerBehavior, MockMinerClient, ScoringSweep,
    StaticChainData,
};

use super::{open_store, ranked};

pub fn run(
    requests: usize,
    miners: usize,
    store_dir: Option<PathBuf>,
    format: String,
) -> Result<()> {
    if requests == 0 || miners == 0 {
        bail!("demo needs at least one request and one miner");
    }

    let mut config = EngineConfig::from_env()?;
    // Compress the lifecycle so a full round finishes in a few seconds.
    config.sweep.interval_ms = 200;
    config.sweep.scoring_horizon_ms = 200;
    config.scoring.response_timeout_secs = config.scoring.response_timeout_secs.min(2.0);

    let store: Arc<dyn RequestStore> = match &store_dir {
        Some(dir) => open_store(dir)?,
        None => Arc::new(MemoryRequestStore::new()),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(round(requests, miners, store, config, format))?;

    if let Some(dir) = store_dir {
        println!(
            "💾 Records kept under {}, inspect them with `yieldnet show`",
            dir.display()
        );
    }
    Ok(())
}

/// Issue synthetic requests, collect scripted answers, then sweep the
/// store until every request reaches a terminal state.
async fn round(
    n_requests: usize,
    n_miners: usize,
    store: Arc<dyn RequestStore>,
    config: EngineConfig,
    format: String,
) -> Result<()> {
    let metrics = Arc::new(EngineMetrics::new());
    let (client, miner_ids) = script_miners(n_miners);
    let sweep = ScoringSweep::new(
        store.clone(),
        Arc::new(StaticChainData::new(BTreeMap::new())),
        Arc::new(MemoryWeightSink::new()),
        metrics.clone(),
        config.clone(),
    );

    let mut rng = rand::thread_rng();
    let mut issued = Vec::with_capacity(n_requests);
    for _ in 0..n_requests {
        let request = gen::fresh_request(&mut rng, &config.generator, now_ms());
        store.create(request.clone())?;
        metrics.requests_created.inc();
        let outcome = dispatch_request(
            store.as_ref(),
            client.clone(),
            &metrics,
            &request,
            miner_ids.clone(),
            &config,
        )
        .await?;
        info!(
            request = %request.id,
            responders = outcome.responders,
            silent = outcome.silent,
            flagged = outcome.flagged,
            "request dispatched"
        );
        issued.push(request.id.clone());
    }

    let mut passes = 0u32;
    while !store.list_active()?.is_empty() {
        passes += 1;
        if passes > 50 {
            bail!("demo requests failed to drain after {passes} sweep passes");
        }
        tokio::time::sleep(Duration::from_millis(config.sweep.interval_ms as u64)).await;
        sweep.sweep_once().await?;
    }

    match format.as_str() {
        "json" => print_json(store.as_ref(), &issued, &metrics),
        _ => print_human(store.as_ref(), &issued, &metrics),
    }
}

/// Miners with a spread of behaviors: honest splitters, concentrators,
/// a slow responder, a copycat for the similarity penalty to catch and
/// the occasional silent one.
fn script_miners(n: usize) -> (Arc<MockMinerClient>, Vec<MinerId>) {
    let mut client = MockMinerClient::new();
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let miner = MinerId::new(format!("miner-{i}"));
        client = match i % 5 {
            0 => client.with_miner(miner.clone(), MinerBehavior::EvenSplit),
            1 => client.with_miner(miner.clone(), MinerBehavior::Concentrate),
            2 => client.with_slow_miner(
                miner.clone(),
                MinerBehavior::EvenSplit,
                Duration::from_millis(250),
            ),
            3 => client.with_miner(
                miner.clone(),
                MinerBehavior::SameAs(MinerId::new("miner-1")),
            ),
            _ => client.with_miner(miner.clone(), MinerBehavior::Silent),
        };
        ids.push(miner);
    }
    (Arc::new(client), ids)
}

fn print_human(store: &dyn RequestStore, issued: &[RequestId], metrics: &EngineMetrics) -> Result<()> {
    for id in issued {
        let record = store.load(id)?;
        println!(
            "📊 Request {} ({})",
            record.request.id, record.request.request_type
        );
        match &record.fault {
            Some(fault) => println!("   ⚠️ unscoreable: {fault}"),
            None => {
                for (miner, score) in ranked(&record.scores) {
                    println!(
                        "   {:<12} final {:.4}  yield {:+.6}  latency {:.2}s  penalty x{:.2}",
                        miner.as_str(),
                        score.final_score,
                        score.yield_value,
                        score.latency_seconds,
                        score.similarity_penalty
                    );
                }
            }
        }
        println!();
    }
    println!(
        "✅ {} scored, {} unscoreable; {} submissions ({} flagged), {} silent miners",
        metrics.requests_scored.get(),
        metrics.requests_unscoreable.get(),
        metrics.submissions_received.get(),
        metrics.submissions_flagged.get(),
        metrics.non_responders.get(),
    );
    Ok(())
}

fn print_json(store: &dyn RequestStore, issued: &[RequestId], metrics: &EngineMetrics) -> Result<()> {
    let mut requests = serde_json::Map::new();
    for id in issued {
        let record = store.load(id)?;
        requests.insert(id.to_string(), serde_json::to_value(&record.scores)?);
    }
    let out = serde_json::json!({
        "requests": requests,
        "metrics": metrics.to_json(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
