//! `yieldnet sweep` command implementation

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use yieldnet_core::config::EngineConfig;
use yieldnet_core::metrics::EngineMetrics;
use yieldnet_core::sim::ChainObservation;
use yieldnet_core::PoolId;
use yieldnet_service::{LoggingWeightSink, ScoringSweep, StaticChainData};

use super::open_store;

pub fn run(store_dir: PathBuf, observations: Option<PathBuf>) -> Result<()> {
    let config = EngineConfig::from_env()?;
    let store = open_store(&store_dir)?;
    let chain = Arc::new(StaticChainData::new(load_observations(observations)?));
    let metrics = Arc::new(EngineMetrics::new());
    let sweep = ScoringSweep::new(
        store,
        chain,
        Arc::new(LoggingWeightSink),
        metrics.clone(),
        config,
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(async move { sweep.run(shutdown_rx).await });

        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        info!("ctrl-c received, stopping sweep");
        let _ = shutdown_tx.send(true);
        worker.await.context("joining sweep worker")?;
        Ok::<(), anyhow::Error>(())
    })?;

    // Final metrics snapshot for the operator's terminal.
    println!("{}", metrics.render_prometheus());
    Ok(())
}

/// Pool observations for organic requests, read once at startup.
fn load_observations(path: Option<PathBuf>) -> Result<BTreeMap<PoolId, ChainObservation>> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading observations from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing observations in {}", path.display()))
}
