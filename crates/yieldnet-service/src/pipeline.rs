//! The deterministic scoring computation.
//!
//! Runs strictly under a scoring claim: the sweep claims a request,
//! calls [`score_claimed`] and commits the result with its fencing
//! token. The computation itself is pure. Given the same record, the
//! same observations and the same config it returns bit-identical
//! scores, which is what makes crash-retried scoring safe to repeat.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use yieldnet_core::config::EngineConfig;
use yieldnet_core::scoring::{self, ResponderInput};
use yieldnet_core::sim::{self, ChainObservation, SimInputs};
use yieldnet_core::store::StoredRequest;
use yieldnet_core::{
    similarity, validation, Allocation, EngineError, MinerId, MinerScore, PoolId, RequestType,
    Result,
};

/// Score one claimed request.
///
/// 1. Build the shared yield inputs: regenerate the seeded trajectory
///    for a synthetic request, or take the chain observations for an
///    organic one.
/// 2. Convert unflagged submissions into clean allocations.
/// 3. Compute similarity penalty factors over the clean set.
/// 4. Simulate every clean allocation against the shared inputs.
/// 5. Aggregate yield, latency and penalties into final scores for the
///    whole dispatched set.
#[instrument(skip_all, fields(request = %record.request.id))]
pub fn score_claimed(
    record: &StoredRequest,
    end_observations: Option<&BTreeMap<PoolId, ChainObservation>>,
    elapsed_ms: i64,
    config: &EngineConfig,
) -> Result<BTreeMap<MinerId, MinerScore>> {
    let request = &record.request;

    let trajectory;
    let inputs = match request.request_type {
        RequestType::Synthetic => {
            let params = request
                .sim_params
                .ok_or_else(|| EngineError::UnscoreableRequest {
                    id: request.id.clone(),
                    reason: "synthetic request lost its simulation parameters".into(),
                })?;
            trajectory = sim::generate_trajectory(request, &params, &config.sim);
            SimInputs::Synthetic {
                config: &config.sim,
                trajectory: &trajectory,
            }
        }
        RequestType::Organic => {
            let end_observations =
                end_observations.ok_or_else(|| EngineError::UnscoreableRequest {
                    id: request.id.clone(),
                    reason: "organic request scored without chain observations".into(),
                })?;
            SimInputs::Organic {
                end_observations,
                elapsed_ms,
            }
        }
    };

    let mut clean: BTreeMap<MinerId, Allocation> = BTreeMap::new();
    for (miner, submission) in &record.submissions {
        if submission.flag.is_ok() {
            clean.insert(
                miner.clone(),
                validation::to_allocation(&submission.allocation),
            );
        }
    }
    let penalties = similarity::penalty_factors(
        &clean,
        &request.pool_ids(),
        request.total_assets,
        &config.similarity,
    );

    let mut responder_inputs = BTreeMap::new();
    for (miner, submission) in &record.submissions {
        let yield_value = match clean.get(miner) {
            Some(allocation) => sim::simulate(request, allocation, &inputs),
            None => 0.0,
        };
        responder_inputs.insert(
            miner.clone(),
            ResponderInput {
                yield_value,
                latency_seconds: submission.latency_seconds,
                flagged: !submission.flag.is_ok(),
            },
        );
    }
    debug!(
        responders = responder_inputs.len(),
        clean = clean.len(),
        "scoring inputs assembled"
    );

    Ok(scoring::aggregate(
        &record.miners,
        &responder_inputs,
        &penalties,
        request.request_type,
        &config.scoring,
    ))
}
