//! Final score aggregation.
//!
//! Each dispatched miner ends up with a score in [0, 1], comparable only
//! within its request. The score is a convex combination of a yield
//! component (normalized simulated yield, scaled by the similarity
//! penalty) and a latency component (a sigmoid that decays toward the
//! response timeout and is exactly zero at it). Non-responders and
//! flagged submissions take the floor score of zero; they never abort
//! aggregation for the rest.
//!
//! Organic requests can run in a rank-binned mode instead of magnitude
//! normalization: responders are grouped into yield bins and scored by
//! bin position, which tolerates the noisier realized-yield numbers.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::ScoringConfig;
use crate::{MinerId, MinerScore, RequestType};

/// Scoreable facts about one responding miner entering aggregation.
#[derive(Debug, Clone, Copy)]
pub struct ResponderInput {
    /// Annualized yield fraction from simulation or chain observation.
    pub yield_value: f64,
    pub latency_seconds: f64,
    /// Set when validation flagged the submission; forces the floor score.
    pub flagged: bool,
}

// =============================================================================
// Latency
// =============================================================================

/// Sigmoid latency credit in [0, 1]; exactly zero at or past the timeout.
pub fn latency_component(latency_seconds: f64, config: &ScoringConfig) -> f64 {
    let timeout = config.response_timeout_secs;
    if latency_seconds >= timeout {
        return 0.0;
    }
    let t = latency_seconds.max(0.0);
    let midpoint = timeout * config.sigmoid_midpoint_frac;
    1.0 / (1.0 + (config.sigmoid_steepness * (t - midpoint)).exp())
}

// =============================================================================
// Yield basis
// =============================================================================

/// Scale yields into [0, 1] against the best responder (or a fixed
/// reference when configured). Negative yields floor at zero; if nobody
/// earned a positive yield, everybody's component is zero.
pub fn normalize_yields(
    yields: &BTreeMap<MinerId, f64>,
    config: &ScoringConfig,
) -> BTreeMap<MinerId, f64> {
    let denominator = match config.reference_apy {
        Some(reference) => reference,
        None => yields.values().fold(0.0f64, |acc, y| acc.max(*y)),
    };
    yields
        .iter()
        .map(|(miner, y)| {
            let scaled = if denominator > 0.0 {
                (y.max(0.0) / denominator).min(1.0)
            } else {
                0.0
            };
            (miner.clone(), scaled)
        })
        .collect()
}

/// Group responders into yield bins and score by bin position.
///
/// Responders are sorted by yield descending (ties broken by miner id so
/// the grouping is deterministic); a new bin opens whenever a yield falls
/// more than `bin_threshold` relative distance below the current bin's
/// base. Bin `i` scores `max(0, 1 - bin_decay * i)`.
pub fn bin_scores(yields: &BTreeMap<MinerId, f64>, config: &ScoringConfig) -> BTreeMap<MinerId, f64> {
    let mut ranked: Vec<(&MinerId, f64)> = yields.iter().map(|(m, y)| (m, *y)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut scores = BTreeMap::new();
    let mut bin_idx = 0usize;
    let mut bin_base = f64::NAN;
    for (position, (miner, y)) in ranked.iter().enumerate() {
        if position == 0 {
            bin_base = *y;
        } else {
            let scale = bin_base.abs().max(y.abs()).max(1.0);
            if (bin_base - y).abs() / scale > config.bin_threshold {
                bin_idx += 1;
                bin_base = *y;
            }
        }
        let score = (1.0 - config.bin_decay * bin_idx as f64).max(0.0);
        scores.insert((*miner).clone(), score);
    }
    scores
}

// =============================================================================
// Aggregation
// =============================================================================

/// Combine yield, similarity and latency into final per-miner scores.
///
/// Every miner in `dispatched` gets a score: miners without an entry in
/// `inputs` (no response before the timeout) and flagged submissions take
/// [`MinerScore::floor`]. Deterministic for fixed inputs.
pub fn aggregate(
    dispatched: &[MinerId],
    inputs: &BTreeMap<MinerId, ResponderInput>,
    penalties: &BTreeMap<MinerId, f64>,
    request_type: RequestType,
    config: &ScoringConfig,
) -> BTreeMap<MinerId, MinerScore> {
    // Only clean responders participate in the yield basis; flagged
    // submissions would otherwise distort the maximum or the bins.
    let clean_yields: BTreeMap<MinerId, f64> = inputs
        .iter()
        .filter(|(_, input)| !input.flagged)
        .map(|(miner, input)| (miner.clone(), input.yield_value))
        .collect();

    let rank_mode = request_type == RequestType::Organic && config.organic_rank_binning;
    let yield_basis = if rank_mode {
        bin_scores(&clean_yields, config)
    } else {
        normalize_yields(&clean_yields, config)
    };

    let mut scores = BTreeMap::new();
    for miner in dispatched {
        let score = match inputs.get(miner) {
            None => MinerScore::floor(config.response_timeout_secs),
            Some(input) if input.flagged => MinerScore::floor(input.latency_seconds),
            Some(input) => {
                let penalty = penalties.get(miner).copied().unwrap_or(1.0);
                let yield_part = yield_basis.get(miner).copied().unwrap_or(0.0);
                let latency_part = latency_component(input.latency_seconds, config);
                let combined = config.w_yield * yield_part * penalty
                    + config.w_latency * latency_part;
                MinerScore {
                    yield_value: input.yield_value,
                    latency_seconds: input.latency_seconds,
                    similarity_penalty: penalty,
                    final_score: combined.clamp(0.0, 1.0),
                }
            }
        };
        debug!(miner = %miner, score = score.final_score, "aggregated");
        scores.insert(miner.clone(), score);
    }
    scores
}
