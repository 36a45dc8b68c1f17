//! YieldNet core: the pool yield-simulation and miner-scoring engine.
//!
//! A validator hands a set of lending pools and a capital ceiling to a set
//! of miners; each miner proposes how to split the capital across the
//! pools. This crate evaluates those proposals objectively and converts
//! them into bounded, comparable per-miner scores:
//!
//! - [`pool`]: pool kinds and the kinked interest-rate model
//! - [`gen`]: deterministic synthetic request generation
//! - [`validation`]: allocation sanity flags (never rejections)
//! - [`sim`]: seeded trajectory simulation and realized-yield accrual
//! - [`similarity`]: near-duplicate detection and penalty factors
//! - [`scoring`]: yield/latency aggregation into final scores
//! - [`lifecycle`] / [`store`]: durable request state with atomic
//!   scoring claims
//!
//! All randomness is derived from per-request seeds ([`seed`]): given the
//! same request id and the same submissions, every pipeline stage is
//! reproducible. Faulty inputs (over-capital allocations, unknown pools,
//! missing responses) are absorbed into floor scores rather than errors,
//! so one bad miner can never abort a scoring pass for the rest.

pub mod config;
pub mod gen;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod scoring;
pub mod seed;
pub mod sim;
pub mod similarity;
pub mod store;
pub mod validation;
pub mod wad;

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use lifecycle::RequestState;
pub use pool::{ChainPool, PoolKind, SyntheticPool};
pub use validation::ValidationFlag;

// =============================================================================
// Identifiers and primitive aliases
// =============================================================================

/// Unique identifier of one allocation request (hex string).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Draw a fresh 16-byte hex id from the given RNG.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Miner identifier: a network uid or hotkey, kept opaque here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinerId(String);

impl MinerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MinerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pool identifier: a contract address or an opaque venue id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capital amounts are WAD-scaled integers: 1 token = 10^18.
pub type Amount = u128;

/// Unix timestamp in milliseconds.
pub type UnixMillis = i64;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> UnixMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Constants
// =============================================================================

/// Hard cap on pools per request.
pub const MAX_POOLS_PER_REQUEST: usize = 64;

/// Hard cap on the dispatched miner set per request.
pub const MAX_MINERS_PER_REQUEST: usize = 256;

/// Milliseconds in a 365-day year; rates are annualized against this.
pub const YEAR_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Upper bound on synthetic simulation horizons.
pub const MAX_HORIZON_STEPS: u32 = 10_000;

// =============================================================================
// Requests, submissions, scores
// =============================================================================

/// How a request's yield is determined at scoring time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Internally generated challenge; yield comes from a seeded simulation.
    Synthetic,
    /// Caller-supplied problem over live venues; yield comes from observed
    /// on-chain state.
    Organic,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::Synthetic => f.write_str("synthetic"),
            RequestType::Organic => f.write_str("organic"),
        }
    }
}

/// Per-request simulation parameters, drawn at generation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimParams {
    /// Number of discrete trajectory steps.
    pub horizon_steps: u32,
    /// Standard deviation of the per-step borrow-rate noise.
    pub stochasticity: f64,
}

/// An allocation exactly as received from a miner. Amounts are signed so
/// that negative submissions survive deserialization and can be flagged
/// instead of failing the whole response.
pub type RawAllocation = BTreeMap<PoolId, i128>;

/// A validated allocation: non-negative WAD amounts per pool.
pub type Allocation = BTreeMap<PoolId, Amount>;

/// The unit of work: one capital-allocation challenge over a pool snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub id: RequestId,
    pub request_type: RequestType,
    /// Capital ceiling for the sum of one miner's allocation, WAD-scaled.
    pub total_assets: Amount,
    /// Pool snapshot at creation time; keys are unique by construction.
    pub pools: BTreeMap<PoolId, PoolKind>,
    /// Present when `request_type` is synthetic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_params: Option<SimParams>,
    /// Free-form request metadata (originating address, tags).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: UnixMillis,
}

impl AllocationRequest {
    /// Validate the request at the ingestion boundary.
    ///
    /// Checks structural invariants only; allocation submissions are
    /// checked separately in [`validation`]. A request that passes here is
    /// guaranteed simulatable: the simulator never re-validates pools.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(EngineError::InvalidRequest {
                id: self.id.clone(),
                reason,
            })
        };
        if self.pools.is_empty() {
            return fail("empty pool snapshot".into());
        }
        if self.pools.len() > MAX_POOLS_PER_REQUEST {
            return fail(format!(
                "{} pools exceeds cap of {MAX_POOLS_PER_REQUEST}",
                self.pools.len()
            ));
        }
        if self.total_assets == 0 {
            return fail("total_assets must be positive".into());
        }
        for (pool_id, kind) in &self.pools {
            if let Err(reason) = kind.validate() {
                return fail(format!("pool {pool_id}: {reason}"));
            }
            let matches_type = match (self.request_type, kind) {
                (RequestType::Synthetic, PoolKind::Synthetic(_)) => true,
                (RequestType::Organic, PoolKind::Chain(_)) => true,
                _ => false,
            };
            if !matches_type {
                return fail(format!(
                    "pool {pool_id} kind does not match {} request",
                    self.request_type
                ));
            }
        }
        match (self.request_type, &self.sim_params) {
            (RequestType::Synthetic, None) => {
                return fail("synthetic request without simulation parameters".into());
            }
            (RequestType::Synthetic, Some(params)) => {
                if params.horizon_steps == 0 || params.horizon_steps > MAX_HORIZON_STEPS {
                    return fail(format!(
                        "horizon_steps {} outside 1..={MAX_HORIZON_STEPS}",
                        params.horizon_steps
                    ));
                }
                if !params.stochasticity.is_finite() || params.stochasticity < 0.0 {
                    return fail("stochasticity must be finite and non-negative".into());
                }
            }
            (RequestType::Organic, _) => {}
        }
        Ok(())
    }

    pub fn is_synthetic(&self) -> bool {
        self.request_type == RequestType::Synthetic
    }

    /// Pool ids in sorted order; the canonical axis for allocation vectors.
    pub fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.keys().cloned().collect()
    }
}

/// One miner's response to a request, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// The raw allocation as received, unmodified.
    pub allocation: RawAllocation,
    /// Validation outcome; anything but `Ok` floor-scores the miner.
    pub flag: ValidationFlag,
    /// Observed round-trip latency.
    pub latency_seconds: f64,
    pub received_at: UnixMillis,
}

/// Final scoring record for one (request, miner) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerScore {
    /// Annualized yield fraction attributed to the miner's allocation.
    pub yield_value: f64,
    pub latency_seconds: f64,
    /// Multiplicative similarity factor in (0, 1].
    pub similarity_penalty: f64,
    /// Bounded final score in [0, 1]; comparable within one request only.
    pub final_score: f64,
}

impl MinerScore {
    /// The floor score handed to non-responders and flagged submissions.
    pub fn floor(latency_seconds: f64) -> Self {
        Self {
            yield_value: 0.0,
            latency_seconds,
            similarity_penalty: 1.0,
            final_score: 0.0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Engine-wide error type.
///
/// Only lifecycle violations and store faults surface as errors; malformed
/// miner input never does (it is flagged and floor-scored instead).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request {id}: {reason}")]
    InvalidRequest { id: RequestId, reason: String },

    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    #[error("request {id} is {state}: {action} not allowed")]
    WrongState {
        id: RequestId,
        state: RequestState,
        action: &'static str,
    },

    #[error("request {id} already scored")]
    AlreadyScored { id: RequestId },

    #[error("request {id} not claimable: {reason}")]
    NotClaimable { id: RequestId, reason: String },

    #[error("scoring claim for request {id} is no longer held")]
    ClaimLost { id: RequestId },

    #[error("request {id} unscoreable: {reason}")]
    UnscoreableRequest { id: RequestId, reason: String },

    #[error("store fault: {0}")]
    Store(String),

    #[error("store I/O at {path}: {source}")]
    StoreIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store record at {path}: {source}")]
    StoreCorrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SyntheticPool;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn synthetic_pool() -> PoolKind {
        PoolKind::Synthetic(SyntheticPool {
            base_rate: 0.01,
            base_slope: 0.05,
            kink_slope: 0.5,
            optimal_util_rate: 0.8,
            borrow_amount: 50.0,
            reserve_size: 100.0,
            reserve_factor: 0.0,
        })
    }

    fn request() -> AllocationRequest {
        let mut pools = BTreeMap::new();
        pools.insert(PoolId::new("0xaa"), synthetic_pool());
        pools.insert(PoolId::new("0xbb"), synthetic_pool());
        AllocationRequest {
            id: RequestId::new("req-1"),
            request_type: RequestType::Synthetic,
            total_assets: wad::WAD,
            pools,
            sim_params: Some(SimParams {
                horizon_steps: 10,
                stochasticity: 0.01,
            }),
            metadata: BTreeMap::new(),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn generated_ids_are_deterministic_per_seed() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        assert_eq!(RequestId::generate(&mut a), RequestId::generate(&mut b));
        let mut c = StdRng::seed_from_u64(8);
        assert_ne!(RequestId::generate(&mut a), RequestId::generate(&mut c));
    }

    #[test]
    fn valid_request_passes_validation() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn empty_snapshot_is_rejected() {
        let mut req = request();
        req.pools.clear();
        assert!(matches!(
            req.validate(),
            Err(EngineError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn zero_total_assets_is_rejected() {
        let mut req = request();
        req.total_assets = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn synthetic_request_requires_sim_params() {
        let mut req = request();
        req.sim_params = None;
        assert!(req.validate().is_err());
    }

    #[test]
    fn pool_kind_must_match_request_type() {
        let mut req = request();
        req.request_type = RequestType::Organic;
        // Synthetic pools inside an organic request are an ingestion fault.
        assert!(req.validate().is_err());
    }

    #[test]
    fn request_roundtrips_through_json() {
        let req = request();
        let encoded = serde_json::to_string(&req).expect("serialize");
        let decoded: AllocationRequest = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(req, decoded);
    }

    #[test]
    fn floor_score_is_zero() {
        let score = MinerScore::floor(10.0);
        assert_eq!(score.final_score, 0.0);
        assert_eq!(score.yield_value, 0.0);
        assert_eq!(score.similarity_penalty, 1.0);
    }
}
