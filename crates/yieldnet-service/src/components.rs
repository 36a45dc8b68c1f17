//! Trait boundaries for the validator's network edges.
//!
//! Production deployments implement these against the live network. The
//! in-process implementations below answer from scripts and fixed data
//! instead, which is what the test suite and the demo runner use.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use yieldnet_core::sim::ChainObservation;
use yieldnet_core::{AllocationRequest, MinerId, MinerScore, PoolId, RawAllocation, RequestId};

use crate::{Result, ServiceError};

// =============================================================================
// Trait boundaries
// =============================================================================

/// Transport to the miner set.
#[async_trait]
pub trait MinerClient: Send + Sync {
    /// Ask `miner` for its allocation. `None` means no usable answer
    /// arrived; the caller treats the miner as a non-responder. Transport
    /// failures are absorbed here, never surfaced as errors.
    async fn request_allocation(
        &self,
        miner: &MinerId,
        request: &AllocationRequest,
    ) -> Option<RawAllocation>;
}

/// Read-side view of live pool state, used to realize organic yields.
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// Observe the current borrow and reserve state of the given pools.
    /// Pools the source cannot see are absent from the result; the
    /// scoring pipeline treats allocations to them as yielding nothing.
    async fn observe(&self, pools: &[PoolId]) -> Result<BTreeMap<PoolId, ChainObservation>>;
}

/// Outbound channel for committed scores.
#[async_trait]
pub trait WeightSink: Send + Sync {
    async fn publish(
        &self,
        request: &RequestId,
        scores: &BTreeMap<MinerId, MinerScore>,
    ) -> Result<()>;
}

// =============================================================================
// MockMinerClient
// =============================================================================

/// How a scripted miner answers.
#[derive(Debug, Clone)]
pub enum MinerBehavior {
    /// Answer with exactly this allocation.
    Fixed(RawAllocation),
    /// Split the request's capital evenly across all pools.
    EvenSplit,
    /// Put all capital into the first pool.
    Concentrate,
    /// Copy another scripted miner's answer, which is what the
    /// similarity penalty exists to catch. One hop only: a copycat
    /// pointing at another copycat, or at an unscripted miner, stays
    /// silent.
    SameAs(MinerId),
    /// Never answer.
    Silent,
}

/// A miner client that answers from a per-miner script instead of the
/// network. Miners without a script never answer.
pub struct MockMinerClient {
    scripts: BTreeMap<MinerId, (MinerBehavior, Duration)>,
}

impl MockMinerClient {
    pub fn new() -> Self {
        Self {
            scripts: BTreeMap::new(),
        }
    }

    /// Script a miner to answer instantly.
    pub fn with_miner(mut self, miner: MinerId, behavior: MinerBehavior) -> Self {
        self.scripts.insert(miner, (behavior, Duration::ZERO));
        self
    }

    /// Script a miner to answer after a fixed delay.
    pub fn with_slow_miner(
        mut self,
        miner: MinerId,
        behavior: MinerBehavior,
        delay: Duration,
    ) -> Self {
        self.scripts.insert(miner, (behavior, delay));
        self
    }
}

impl Default for MockMinerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MinerClient for MockMinerClient {
    async fn request_allocation(
        &self,
        miner: &MinerId,
        request: &AllocationRequest,
    ) -> Option<RawAllocation> {
        let (behavior, delay) = self.scripts.get(miner)?;
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }
        let behavior = match behavior {
            MinerBehavior::SameAs(target) => &self.scripts.get(target)?.0,
            direct => direct,
        };
        match behavior {
            MinerBehavior::Fixed(allocation) => Some(allocation.clone()),
            MinerBehavior::EvenSplit => {
                let pools = request.pool_ids();
                let share = request.total_assets / pools.len() as u128;
                Some(pools.into_iter().map(|id| (id, share as i128)).collect())
            }
            MinerBehavior::Concentrate => {
                let first = request.pool_ids().into_iter().next()?;
                Some(BTreeMap::from([(first, request.total_assets as i128)]))
            }
            MinerBehavior::SameAs(_) | MinerBehavior::Silent => None,
        }
    }
}

// =============================================================================
// StaticChainData
// =============================================================================

/// A chain data source serving a fixed observation set.
pub struct StaticChainData {
    observations: BTreeMap<PoolId, ChainObservation>,
    fail: bool,
}

impl StaticChainData {
    pub fn new(observations: BTreeMap<PoolId, ChainObservation>) -> Self {
        Self {
            observations,
            fail: false,
        }
    }

    /// A source whose every read fails, for exercising retry paths.
    pub fn failing() -> Self {
        Self {
            observations: BTreeMap::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl ChainDataSource for StaticChainData {
    async fn observe(&self, pools: &[PoolId]) -> Result<BTreeMap<PoolId, ChainObservation>> {
        if self.fail {
            return Err(ServiceError::ChainData(
                "static source configured to fail".into(),
            ));
        }
        Ok(pools
            .iter()
            .filter_map(|id| self.observations.get(id).map(|obs| (id.clone(), *obs)))
            .collect())
    }
}

// =============================================================================
// Weight sinks
// =============================================================================

/// Logs committed scores instead of publishing them anywhere.
pub struct LoggingWeightSink;

#[async_trait]
impl WeightSink for LoggingWeightSink {
    async fn publish(
        &self,
        request: &RequestId,
        scores: &BTreeMap<MinerId, MinerScore>,
    ) -> Result<()> {
        for (miner, score) in scores {
            info!(%request, %miner, score = score.final_score, "weight");
        }
        Ok(())
    }
}

/// Captures published scores in memory for assertions.
#[derive(Default)]
pub struct MemoryWeightSink {
    published: Mutex<Vec<(RequestId, BTreeMap<MinerId, MinerScore>)>>,
}

impl MemoryWeightSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(RequestId, BTreeMap<MinerId, MinerScore>)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl WeightSink for MemoryWeightSink {
    async fn publish(
        &self,
        request: &RequestId,
        scores: &BTreeMap<MinerId, MinerScore>,
    ) -> Result<()> {
        self.published
            .lock()
            .map_err(|_| ServiceError::WeightSink("sink mutex poisoned".into()))?
            .push((request.clone(), scores.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yieldnet_core::config::GeneratorConfig;
    use yieldnet_core::{gen, RequestId};

    fn request() -> AllocationRequest {
        gen::generate_request(
            RequestId::new("component-test"),
            &GeneratorConfig::default(),
            1_000,
        )
    }

    #[tokio::test]
    async fn scripted_behaviors_answer_as_configured() {
        let request = request();
        let fixed: RawAllocation =
            BTreeMap::from([(request.pool_ids().remove(0), request.total_assets as i128)]);
        let client = MockMinerClient::new()
            .with_miner(MinerId::new("fixed"), MinerBehavior::Fixed(fixed.clone()))
            .with_miner(MinerId::new("even"), MinerBehavior::EvenSplit)
            .with_miner(MinerId::new("whale"), MinerBehavior::Concentrate)
            .with_miner(MinerId::new("mute"), MinerBehavior::Silent);

        let got = client
            .request_allocation(&MinerId::new("fixed"), &request)
            .await;
        assert_eq!(got, Some(fixed));

        let even = client
            .request_allocation(&MinerId::new("even"), &request)
            .await
            .expect("even split answers");
        assert_eq!(even.len(), request.pools.len());

        let whale = client
            .request_allocation(&MinerId::new("whale"), &request)
            .await
            .expect("concentrate answers");
        assert_eq!(whale.len(), 1);
        assert_eq!(
            whale.values().next().copied(),
            Some(request.total_assets as i128)
        );

        let mute = client
            .request_allocation(&MinerId::new("mute"), &request)
            .await;
        assert_eq!(mute, None);
    }

    #[tokio::test]
    async fn copycats_mirror_their_target_one_hop_only() {
        let request = request();
        let client = MockMinerClient::new()
            .with_miner(MinerId::new("whale"), MinerBehavior::Concentrate)
            .with_miner(
                MinerId::new("copy"),
                MinerBehavior::SameAs(MinerId::new("whale")),
            )
            .with_miner(
                MinerId::new("copy2"),
                MinerBehavior::SameAs(MinerId::new("copy")),
            )
            .with_miner(
                MinerId::new("lost"),
                MinerBehavior::SameAs(MinerId::new("ghost")),
            );

        let original = client
            .request_allocation(&MinerId::new("whale"), &request)
            .await;
        assert!(original.is_some());
        assert_eq!(
            client
                .request_allocation(&MinerId::new("copy"), &request)
                .await,
            original
        );

        // A copycat's copycat and a copycat of an unscripted miner both
        // stay silent.
        assert_eq!(
            client
                .request_allocation(&MinerId::new("copy2"), &request)
                .await,
            None
        );
        assert_eq!(
            client
                .request_allocation(&MinerId::new("lost"), &request)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn unscripted_miners_never_answer() {
        let client = MockMinerClient::new();
        let got = client
            .request_allocation(&MinerId::new("stranger"), &request())
            .await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn static_chain_data_serves_only_known_pools() {
        let known = PoolId::new("0xaa");
        let source = StaticChainData::new(BTreeMap::from([(
            known.clone(),
            ChainObservation {
                borrow_amount: 1,
                reserve_size: 2,
            },
        )]));
        let observed = source
            .observe(&[known.clone(), PoolId::new("0xunknown")])
            .await
            .expect("observe");
        assert_eq!(observed.len(), 1);
        assert!(observed.contains_key(&known));

        assert!(StaticChainData::failing().observe(&[known]).await.is_err());
    }

    #[tokio::test]
    async fn memory_sink_captures_publications_in_order() {
        let sink = MemoryWeightSink::new();
        for n in 0..3 {
            let scores = BTreeMap::from([(MinerId::new("m"), MinerScore::floor(n as f64))]);
            sink.publish(&RequestId::new(format!("req-{n}")), &scores)
                .await
                .expect("publish");
        }
        let published = sink.published();
        assert_eq!(published.len(), 3);
        assert_eq!(published[0].0, RequestId::new("req-0"));
        assert_eq!(published[2].0, RequestId::new("req-2"));
    }
}
