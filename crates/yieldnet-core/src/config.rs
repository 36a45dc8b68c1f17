//! Engine configuration.
//!
//! One aggregate [`EngineConfig`] with per-component sub-configs. Every
//! tunable has a sane default; overrides come from the builder or from
//! `YIELDNET_*` environment variables. `validate()` runs at startup and
//! again at the top of each scoring pass, so a hand-edited config cannot
//! silently skew scores.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::similarity::DistanceMetric;
use crate::wad::WAD;
use crate::{Amount, EngineError, Result, MAX_POOLS_PER_REQUEST};

// =============================================================================
// Sub-configs
// =============================================================================

/// An inclusive float range sampled on a fixed quantization step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParamRange {
    pub const fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let ok = self.min.is_finite()
            && self.max.is_finite()
            && self.step.is_finite()
            && self.min <= self.max
            && self.step > 0.0;
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(format!(
                "{name}: bad range [{}, {}] step {}",
                self.min, self.max, self.step
            )))
        }
    }
}

/// An inclusive integer range sampled on a fixed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRange {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

impl StepRange {
    pub const fn new(min: u32, max: u32, step: u32) -> Self {
        Self { min, max, step }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.min <= self.max && self.step > 0 && self.min > 0 {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(format!(
                "{name}: bad range [{}, {}] step {}",
                self.min, self.max, self.step
            )))
        }
    }
}

/// Synthetic pool-set generation parameters.
///
/// Range defaults mirror the historical challenge generator: ten pools,
/// one token of capital, quantized curve parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub num_pools: usize,
    /// Capital ceiling per request, WAD-scaled.
    pub total_assets: Amount,
    /// Reserve size of each generated pool, in whole tokens.
    pub pool_reserve_size: f64,
    pub base_rate: ParamRange,
    pub base_slope: ParamRange,
    pub kink_slope: ParamRange,
    pub optimal_util_rate: ParamRange,
    /// Initial borrowed fraction of the reserve.
    pub init_util_rate: ParamRange,
    /// Per-request trajectory length draw.
    pub horizon_steps: StepRange,
    /// Per-request noise level draw.
    pub stochasticity: ParamRange,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_pools: 10,
            total_assets: WAD,
            pool_reserve_size: 1.0,
            base_rate: ParamRange::new(0.01, 0.05, 0.005),
            base_slope: ParamRange::new(0.01, 0.1, 0.01),
            kink_slope: ParamRange::new(0.15, 1.0, 0.05),
            optimal_util_rate: ParamRange::new(0.65, 0.95, 0.05),
            init_util_rate: ParamRange::new(0.1, 0.95, 0.05),
            horizon_steps: StepRange::new(50, 100, 10),
            stochasticity: ParamRange::new(0.01, 0.05, 0.005),
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_pools == 0 || self.num_pools > MAX_POOLS_PER_REQUEST {
            return Err(EngineError::InvalidConfig(format!(
                "generator.num_pools {} outside 1..={MAX_POOLS_PER_REQUEST}",
                self.num_pools
            )));
        }
        if self.total_assets == 0 {
            return Err(EngineError::InvalidConfig(
                "generator.total_assets must be positive".into(),
            ));
        }
        if !(self.pool_reserve_size.is_finite() && self.pool_reserve_size > 0.0) {
            return Err(EngineError::InvalidConfig(
                "generator.pool_reserve_size must be positive".into(),
            ));
        }
        self.base_rate.validate("generator.base_rate")?;
        self.base_slope.validate("generator.base_slope")?;
        self.kink_slope.validate("generator.kink_slope")?;
        self.optimal_util_rate.validate("generator.optimal_util_rate")?;
        self.init_util_rate.validate("generator.init_util_rate")?;
        self.horizon_steps.validate("generator.horizon_steps")?;
        self.stochasticity.validate("generator.stochasticity")?;
        if self.optimal_util_rate.min <= 0.0 || self.optimal_util_rate.max > 1.0 {
            return Err(EngineError::InvalidConfig(
                "generator.optimal_util_rate must stay inside (0, 1]".into(),
            ));
        }
        if self.init_util_rate.min < 0.0 || self.init_util_rate.max > 1.0 {
            return Err(EngineError::InvalidConfig(
                "generator.init_util_rate must stay inside [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Synthetic trajectory parameters shared by all requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Pull of each pool's borrow rate toward the cross-pool median.
    pub reversion_speed: f64,
    /// Wall-clock span modeled by one trajectory step.
    pub step_duration_ms: i64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            reversion_speed: 0.05,
            step_duration_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.reversion_speed.is_finite() && (0.0..=1.0).contains(&self.reversion_speed)) {
            return Err(EngineError::InvalidConfig(
                "sim.reversion_speed outside [0, 1]".into(),
            ));
        }
        if self.step_duration_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "sim.step_duration_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Score aggregation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight of the (penalized) yield component.
    pub w_yield: f64,
    /// Weight of the latency component; `w_yield + w_latency == 1`.
    pub w_latency: f64,
    /// Responses slower than this score zero latency credit and are
    /// treated as non-responses by the collector.
    pub response_timeout_secs: f64,
    pub sigmoid_steepness: f64,
    /// Sigmoid midpoint as a fraction of the response timeout.
    pub sigmoid_midpoint_frac: f64,
    /// Fixed normalization reference; `None` divides by the best observed
    /// yield per request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_apy: Option<f64>,
    /// Score organic requests by relative-difference rank bins instead of
    /// the weighted combination.
    pub organic_rank_binning: bool,
    /// Relative yield drop that opens a new bin.
    pub bin_threshold: f64,
    /// Base-score decay per bin index.
    pub bin_decay: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            w_yield: 0.8,
            w_latency: 0.2,
            response_timeout_secs: 10.0,
            sigmoid_steepness: 1.0,
            sigmoid_midpoint_frac: 2.0 / 3.0,
            reference_apy: None,
            organic_rank_binning: true,
            bin_threshold: 0.05,
            bin_decay: 0.1,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        let weights_ok = self.w_yield.is_finite()
            && self.w_latency.is_finite()
            && (0.0..=1.0).contains(&self.w_yield)
            && (0.0..=1.0).contains(&self.w_latency)
            && (self.w_yield + self.w_latency - 1.0).abs() < 1e-9;
        if !weights_ok {
            return Err(EngineError::InvalidConfig(format!(
                "scoring weights must lie in [0,1] and sum to 1 (got {} + {})",
                self.w_yield, self.w_latency
            )));
        }
        if !(self.response_timeout_secs.is_finite() && self.response_timeout_secs > 0.0) {
            return Err(EngineError::InvalidConfig(
                "scoring.response_timeout_secs must be positive".into(),
            ));
        }
        if !(self.sigmoid_steepness.is_finite() && self.sigmoid_steepness > 0.0) {
            return Err(EngineError::InvalidConfig(
                "scoring.sigmoid_steepness must be positive".into(),
            ));
        }
        if !(self.sigmoid_midpoint_frac.is_finite()
            && self.sigmoid_midpoint_frac > 0.0
            && self.sigmoid_midpoint_frac <= 1.0)
        {
            return Err(EngineError::InvalidConfig(
                "scoring.sigmoid_midpoint_frac outside (0, 1]".into(),
            ));
        }
        if let Some(reference) = self.reference_apy {
            if !(reference.is_finite() && reference > 0.0) {
                return Err(EngineError::InvalidConfig(
                    "scoring.reference_apy must be positive".into(),
                ));
            }
        }
        if !(self.bin_threshold.is_finite() && self.bin_threshold > 0.0) {
            return Err(EngineError::InvalidConfig(
                "scoring.bin_threshold must be positive".into(),
            ));
        }
        if !(self.bin_decay.is_finite() && self.bin_decay > 0.0 && self.bin_decay <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "scoring.bin_decay outside (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Near-duplicate detection parameters; a tuning surface, not structure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    pub metric: DistanceMetric,
    /// Distances below this draw a penalty.
    pub threshold: f64,
    /// Minimum multiplicative factor; never zero.
    pub floor: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::NormalizedEuclidean,
            threshold: 0.1,
            floor: 0.25,
        }
    }
}

impl SimilarityConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(EngineError::InvalidConfig(
                "similarity.threshold must be positive".into(),
            ));
        }
        if !(self.floor.is_finite() && self.floor > 0.0 && self.floor <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "similarity.floor outside (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Periodic sweep and claim parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub interval_ms: i64,
    /// Delay between freezing a request and scoring eligibility.
    pub scoring_horizon_ms: i64,
    /// How far past the deadline a request may still be scored.
    pub scoring_window_ms: i64,
    /// How long a scoring claim shields a request from re-claiming.
    pub claim_lease_ms: i64,
    /// Cap on concurrently scored requests per sweep.
    pub max_parallel_scoring: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            scoring_horizon_ms: 10 * 60 * 1000,
            scoring_window_ms: 60 * 60 * 1000,
            claim_lease_ms: 60 * 1000,
            max_parallel_scoring: 4,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "sweep.interval_ms must be positive".into(),
            ));
        }
        if self.scoring_horizon_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "sweep.scoring_horizon_ms must be positive".into(),
            ));
        }
        if self.scoring_window_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "sweep.scoring_window_ms must be positive".into(),
            ));
        }
        if self.claim_lease_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "sweep.claim_lease_ms must be positive".into(),
            ));
        }
        if self.max_parallel_scoring == 0 {
            return Err(EngineError::InvalidConfig(
                "sweep.max_parallel_scoring must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Aggregate
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub generator: GeneratorConfig,
    pub sim: SimConfig,
    pub scoring: ScoringConfig,
    pub similarity: SimilarityConfig,
    pub sweep: SweepConfig,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Build a config from `YIELDNET_*` environment variables on top of
    /// the defaults. Unset variables keep their default; malformed values
    /// are configuration errors, not silent fallbacks.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        read_env("YIELDNET_NUM_POOLS", &mut config.generator.num_pools)?;
        read_env("YIELDNET_TOTAL_ASSETS", &mut config.generator.total_assets)?;
        read_env("YIELDNET_REVERSION_SPEED", &mut config.sim.reversion_speed)?;
        read_env("YIELDNET_W_YIELD", &mut config.scoring.w_yield)?;
        read_env("YIELDNET_W_LATENCY", &mut config.scoring.w_latency)?;
        read_env(
            "YIELDNET_RESPONSE_TIMEOUT_SECS",
            &mut config.scoring.response_timeout_secs,
        )?;
        read_env(
            "YIELDNET_SIMILARITY_THRESHOLD",
            &mut config.similarity.threshold,
        )?;
        read_env("YIELDNET_SIMILARITY_FLOOR", &mut config.similarity.floor)?;
        read_env("YIELDNET_SWEEP_INTERVAL_MS", &mut config.sweep.interval_ms)?;
        read_env(
            "YIELDNET_SCORING_HORIZON_MS",
            &mut config.sweep.scoring_horizon_ms,
        )?;
        read_env(
            "YIELDNET_SCORING_WINDOW_MS",
            &mut config.sweep.scoring_window_ms,
        )?;
        read_env("YIELDNET_CLAIM_LEASE_MS", &mut config.sweep.claim_lease_ms)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.generator.validate()?;
        self.sim.validate()?;
        self.scoring.validate()?;
        self.similarity.validate()?;
        self.sweep.validate()?;
        Ok(())
    }
}

fn read_env<T: FromStr>(key: &str, slot: &mut T) -> Result<()> {
    if let Ok(raw) = env::var(key) {
        *slot = raw
            .parse()
            .map_err(|_| EngineError::InvalidConfig(format!("{key}: cannot parse {raw:?}")))?;
    }
    Ok(())
}

/// Builder over [`EngineConfig`]; `build()` validates.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn generator(mut self, generator: GeneratorConfig) -> Self {
        self.config.generator = generator;
        self
    }

    pub fn sim(mut self, sim: SimConfig) -> Self {
        self.config.sim = sim;
        self
    }

    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.config.scoring = scoring;
        self
    }

    pub fn similarity(mut self, similarity: SimilarityConfig) -> Self {
        self.config.similarity = similarity;
        self
    }

    pub fn sweep(mut self, sweep: SweepConfig) -> Self {
        self.config.sweep = sweep;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
