//! Synthetic request generation.
//!
//! Challenges are built from quantized uniform draws over configured
//! parameter ranges. Every draw descends from the request id (see
//! [`crate::seed`]), so a request can be regenerated bit-for-bit from its
//! id and the generator config alone.

use std::collections::BTreeMap;

use rand::Rng;

use crate::config::{GeneratorConfig, ParamRange, StepRange};
use crate::pool::{PoolKind, SyntheticPool};
use crate::{seed, AllocationRequest, PoolId, RequestId, RequestType, SimParams, UnixMillis};

/// Quantized uniform draw over an inclusive range: `min + k * step`.
pub(crate) fn sample_range<R: Rng>(rng: &mut R, range: &ParamRange) -> f64 {
    let buckets = ((range.max - range.min) / range.step).round() as u64;
    let k = rng.gen_range(0..=buckets);
    range.min + k as f64 * range.step
}

fn sample_steps<R: Rng>(rng: &mut R, range: &StepRange) -> u32 {
    let buckets = (range.max - range.min) / range.step;
    let k = rng.gen_range(0..=buckets);
    range.min + k * range.step
}

/// Address-shaped pool id drawn from the request RNG.
fn draw_pool_id<R: Rng>(rng: &mut R) -> PoolId {
    let mut bytes = [0u8; 20];
    rng.fill(&mut bytes);
    PoolId::new(format!("0x{}", hex::encode(bytes)))
}

/// Build the synthetic request identified by `id`.
pub fn generate_request(
    id: RequestId,
    config: &GeneratorConfig,
    now: UnixMillis,
) -> AllocationRequest {
    let mut rng = seed::generator_rng(&id);

    let mut pools = BTreeMap::new();
    while pools.len() < config.num_pools {
        let pool_id = draw_pool_id(&mut rng);
        let init_util = sample_range(&mut rng, &config.init_util_rate);
        let pool = SyntheticPool {
            base_rate: sample_range(&mut rng, &config.base_rate),
            base_slope: sample_range(&mut rng, &config.base_slope),
            kink_slope: sample_range(&mut rng, &config.kink_slope),
            optimal_util_rate: sample_range(&mut rng, &config.optimal_util_rate),
            borrow_amount: config.pool_reserve_size * init_util,
            reserve_size: config.pool_reserve_size,
            reserve_factor: 0.0,
        };
        pools.insert(pool_id, PoolKind::Synthetic(pool));
    }

    let sim_params = SimParams {
        horizon_steps: sample_steps(&mut rng, &config.horizon_steps),
        stochasticity: sample_range(&mut rng, &config.stochasticity),
    };

    AllocationRequest {
        id,
        request_type: RequestType::Synthetic,
        total_assets: config.total_assets,
        pools,
        sim_params: Some(sim_params),
        metadata: BTreeMap::new(),
        created_at: now,
    }
}

/// Draw a fresh id from `id_rng` and build its request.
pub fn fresh_request<R: Rng>(
    id_rng: &mut R,
    config: &GeneratorConfig,
    now: UnixMillis,
) -> AllocationRequest {
    generate_request(RequestId::generate(id_rng), config, now)
}
