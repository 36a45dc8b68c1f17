//! Request fan-out and response collection.
//!
//! One request goes to every miner in its set concurrently, and every
//! miner gets the same response deadline. Answers are validated and
//! recorded as they land; once each miner has either answered or timed
//! out, the request freezes, fixing the submission set that scoring
//! will see, and starts waiting out its scoring period. Miner faults
//! (timeouts, garbage, silence) never abort the pass; only a store
//! fault does.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn};

use yieldnet_core::config::EngineConfig;
use yieldnet_core::metrics::EngineMetrics;
use yieldnet_core::store::RequestStore;
use yieldnet_core::{now_ms, validation, AllocationRequest, MinerId, Submission};

use crate::components::MinerClient;
use crate::Result;

/// What one dispatch pass produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Miners whose answers were recorded, flagged ones included.
    pub responders: usize,
    /// Miners that produced no usable answer before the deadline.
    pub silent: usize,
    /// Recorded answers that failed validation.
    pub flagged: usize,
}

/// Dispatch `request` to `miners`, collect answers until the response
/// deadline, then freeze the request and move it into its scoring
/// wait.
///
/// The request must already exist in the store in the created state.
pub async fn dispatch_request(
    store: &dyn RequestStore,
    client: Arc<dyn MinerClient>,
    metrics: &EngineMetrics,
    request: &AllocationRequest,
    miners: Vec<MinerId>,
    config: &EngineConfig,
) -> Result<DispatchOutcome> {
    let id = request.id.clone();
    store.mark_dispatched(&id, miners.clone(), now_ms())?;
    store.begin_collection(&id)?;

    let deadline = Duration::from_secs_f64(config.scoring.response_timeout_secs);
    let shared = Arc::new(request.clone());
    let tasks: Vec<_> = miners
        .into_iter()
        .map(|miner| {
            let client = Arc::clone(&client);
            let request = Arc::clone(&shared);
            tokio::spawn(async move {
                let started = Instant::now();
                let answer =
                    tokio::time::timeout(deadline, client.request_allocation(&miner, &request))
                        .await;
                let latency = started.elapsed().as_secs_f64();
                match answer {
                    Ok(answer) => (miner, answer, latency),
                    Err(_) => {
                        debug!(%miner, "response deadline elapsed");
                        (miner, None, latency)
                    }
                }
            })
        })
        .collect();

    let mut outcome = DispatchOutcome::default();
    for joined in join_all(tasks).await {
        let Ok((miner, answer, latency)) = joined else {
            warn!(request = %id, "miner task panicked");
            metrics.non_responders.inc();
            outcome.silent += 1;
            continue;
        };
        let Some(raw) = answer else {
            metrics.non_responders.inc();
            outcome.silent += 1;
            continue;
        };
        let flag = validation::validate(&raw, request);
        metrics.submissions_received.inc();
        metrics.miner_latency_seconds.observe(latency);
        if !flag.is_ok() {
            metrics.submissions_flagged.inc();
            outcome.flagged += 1;
        }
        store.record_submission(
            &id,
            &miner,
            Submission {
                allocation: raw,
                flag,
                latency_seconds: latency,
                received_at: now_ms(),
            },
        )?;
        outcome.responders += 1;
    }

    store.freeze(&id, now_ms(), config.sweep.scoring_horizon_ms)?;
    store.make_scoring_pending(&id)?;
    info!(
        request = %id,
        responders = outcome.responders,
        silent = outcome.silent,
        flagged = outcome.flagged,
        "request frozen"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::components::{MinerBehavior, MockMinerClient};
    use yieldnet_core::store::MemoryRequestStore;
    use yieldnet_core::{gen, RawAllocation, RequestId, RequestState};

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scoring.response_timeout_secs = 0.2;
        config
    }

    fn fresh_request(store: &MemoryRequestStore, config: &EngineConfig) -> AllocationRequest {
        let request =
            gen::generate_request(RequestId::new("dispatch-test"), &config.generator, 1_000);
        store.create(request.clone()).expect("create");
        request
    }

    #[tokio::test]
    async fn answers_are_recorded_and_the_request_freezes() {
        let config = fast_config();
        let store = MemoryRequestStore::new();
        let request = fresh_request(&store, &config);

        let client = Arc::new(
            MockMinerClient::new()
                .with_miner(MinerId::new("m1"), MinerBehavior::EvenSplit)
                .with_miner(MinerId::new("m2"), MinerBehavior::Concentrate)
                .with_miner(MinerId::new("m3"), MinerBehavior::Silent),
        );
        let metrics = EngineMetrics::new();
        let outcome = dispatch_request(
            &store,
            client,
            &metrics,
            &request,
            vec![MinerId::new("m1"), MinerId::new("m2"), MinerId::new("m3")],
            &config,
        )
        .await
        .expect("dispatch");

        assert_eq!(outcome.responders, 2);
        assert_eq!(outcome.silent, 1);
        assert_eq!(outcome.flagged, 0);

        let record = store.load(&request.id).expect("load");
        assert_eq!(record.state, RequestState::ScoringPending);
        assert_eq!(record.submissions.len(), 2);
        assert!(record.submissions[&MinerId::new("m1")].latency_seconds >= 0.0);
        assert_eq!(metrics.submissions_received.get(), 2);
        assert_eq!(metrics.non_responders.get(), 1);
    }

    #[tokio::test]
    async fn slow_miners_are_cut_off_at_the_deadline() {
        let config = fast_config();
        let store = MemoryRequestStore::new();
        let request = fresh_request(&store, &config);

        let client = Arc::new(
            MockMinerClient::new()
                .with_miner(MinerId::new("fast"), MinerBehavior::EvenSplit)
                .with_slow_miner(
                    MinerId::new("slow"),
                    MinerBehavior::EvenSplit,
                    Duration::from_millis(600),
                ),
        );
        let metrics = EngineMetrics::new();
        let outcome = dispatch_request(
            &store,
            client,
            &metrics,
            &request,
            vec![MinerId::new("fast"), MinerId::new("slow")],
            &config,
        )
        .await
        .expect("dispatch");

        assert_eq!(outcome.responders, 1);
        assert_eq!(outcome.silent, 1);

        let record = store.load(&request.id).expect("load");
        assert!(record.submissions.contains_key(&MinerId::new("fast")));
        assert!(!record.submissions.contains_key(&MinerId::new("slow")));
    }

    #[tokio::test]
    async fn invalid_answers_are_recorded_flagged_not_dropped() {
        let config = fast_config();
        let store = MemoryRequestStore::new();
        let request = fresh_request(&store, &config);

        let over: RawAllocation = BTreeMap::from([(
            request.pool_ids().remove(0),
            request.total_assets as i128 + 1,
        )]);
        let client = Arc::new(
            MockMinerClient::new().with_miner(MinerId::new("greedy"), MinerBehavior::Fixed(over)),
        );
        let metrics = EngineMetrics::new();
        let outcome = dispatch_request(
            &store,
            client,
            &metrics,
            &request,
            vec![MinerId::new("greedy")],
            &config,
        )
        .await
        .expect("dispatch");

        assert_eq!(outcome.responders, 1);
        assert_eq!(outcome.flagged, 1);

        let record = store.load(&request.id).expect("load");
        assert!(!record.submissions[&MinerId::new("greedy")].flag.is_ok());
        assert_eq!(metrics.submissions_flagged.get(), 1);
    }
}
