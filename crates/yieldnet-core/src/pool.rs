//! Pool kinds and the kinked interest-rate model.
//!
//! Every venue prices borrowing with the same piecewise-linear curve: a
//! gentle slope up to an optimal utilization point, then a steep "kink"
//! slope above it. Synthetic pools carry float parameters and are priced
//! in `f64`; chain pools carry WAD-scaled integers and are priced without
//! ever leaving fixed point. A request holds exactly one kind (enforced at
//! ingestion), so the two numeric paths cannot mix mid-request.

use serde::{Deserialize, Serialize};

use crate::wad::{self, WAD};

/// One lending venue at a point in time.
///
/// Closed set of kinds; the rate model dispatches with a `match`, and
/// serialized payloads are tagged so the ingestion boundary can validate
/// the shape before anything downstream sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolKind {
    Synthetic(SyntheticPool),
    Chain(ChainPool),
}

impl PoolKind {
    /// Check parameter invariants, returning the violated one.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PoolKind::Synthetic(p) => p.validate(),
            PoolKind::Chain(p) => p.validate(),
        }
    }
}

// =============================================================================
// Synthetic pools (float path)
// =============================================================================

/// Simulator-generated pool; whole-token float units, rates as fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticPool {
    /// Borrow rate at zero utilization.
    pub base_rate: f64,
    /// Rate climb from zero to optimal utilization.
    pub base_slope: f64,
    /// Additional climb applied above the optimal point.
    pub kink_slope: f64,
    /// Kink location, in (0, 1].
    pub optimal_util_rate: f64,
    /// Currently borrowed tokens.
    pub borrow_amount: f64,
    /// Total supplied tokens; strictly positive.
    pub reserve_size: f64,
    /// Fraction of borrow interest withheld from suppliers, in [0, 1).
    #[serde(default)]
    pub reserve_factor: f64,
}

impl SyntheticPool {
    /// Borrow and supply rate at the given utilization (clamped to [0,1]).
    pub fn rate_at(&self, utilization: f64) -> (f64, f64) {
        let u = utilization.clamp(0.0, 1.0);
        let opt = self.optimal_util_rate;
        let borrow = if u <= opt {
            self.base_rate + self.base_slope * (u / opt)
        } else {
            // Reached only when opt < 1, so the divisor is positive.
            self.base_rate + self.base_slope + self.kink_slope * ((u - opt) / (1.0 - opt))
        };
        let supply = borrow * u * (1.0 - self.reserve_factor);
        (borrow, supply)
    }

    /// Current utilization, clamped to [0, 1].
    pub fn utilization(&self) -> f64 {
        (self.borrow_amount / self.reserve_size).clamp(0.0, 1.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        let finite = [
            self.base_rate,
            self.base_slope,
            self.kink_slope,
            self.optimal_util_rate,
            self.borrow_amount,
            self.reserve_size,
            self.reserve_factor,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err("non-finite parameter".into());
        }
        if self.base_rate < 0.0 || self.base_slope < 0.0 || self.kink_slope < 0.0 {
            return Err("negative rate parameter".into());
        }
        if !(self.optimal_util_rate > 0.0 && self.optimal_util_rate <= 1.0) {
            return Err("optimal_util_rate outside (0, 1]".into());
        }
        if self.reserve_size <= 0.0 {
            return Err("reserve_size must be positive".into());
        }
        if self.borrow_amount < 0.0 {
            return Err("negative borrow_amount".into());
        }
        if !(0.0..1.0).contains(&self.reserve_factor) {
            return Err("reserve_factor outside [0, 1)".into());
        }
        Ok(())
    }
}

// =============================================================================
// Chain pools (fixed-point path)
// =============================================================================

/// Snapshot of an on-chain lending market; every field WAD-scaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPool {
    /// Venue contract address, as reported by the chain-data source.
    pub contract_address: String,
    pub base_rate: u128,
    pub base_slope: u128,
    pub kink_slope: u128,
    /// Kink location, in (0, WAD].
    pub optimal_util_rate: u128,
    pub borrow_amount: u128,
    /// Strictly positive.
    pub reserve_size: u128,
    #[serde(default)]
    pub reserve_factor: u128,
}

impl ChainPool {
    /// Borrow and supply rate at a WAD utilization (clamped to [0, WAD]).
    ///
    /// Degenerate arithmetic (overflowing intermediates from absurd
    /// chain-reported parameters) collapses the affected term to zero
    /// rather than failing: a data fault costs yield, never the request.
    pub fn rate_at(&self, utilization_wad: u128) -> (u128, u128) {
        let u = utilization_wad.min(WAD);
        let opt = self.optimal_util_rate;
        let borrow = if u <= opt {
            let climb = wad::wad_div(u, opt)
                .and_then(|frac| wad::wad_mul(frac, self.base_slope))
                .unwrap_or(0);
            self.base_rate.saturating_add(climb)
        } else {
            let over = wad::wad_div(u - opt, WAD - opt)
                .and_then(|frac| wad::wad_mul(frac, self.kink_slope))
                .unwrap_or(0);
            self.base_rate
                .saturating_add(self.base_slope)
                .saturating_add(over)
        };
        let keep = WAD.saturating_sub(self.reserve_factor);
        let supply = wad::wad_mul(borrow, u)
            .and_then(|x| wad::wad_mul(x, keep))
            .unwrap_or(0);
        (borrow, supply)
    }

    /// Current utilization in WAD, clamped to [0, WAD].
    pub fn utilization_wad(&self) -> u128 {
        wad::wad_div(self.borrow_amount, self.reserve_size)
            .unwrap_or(0)
            .min(WAD)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.contract_address.is_empty() {
            return Err("empty contract address".into());
        }
        if self.optimal_util_rate == 0 || self.optimal_util_rate > WAD {
            return Err("optimal_util_rate outside (0, WAD]".into());
        }
        if self.reserve_size == 0 {
            return Err("reserve_size must be positive".into());
        }
        if self.reserve_factor >= WAD {
            return Err("reserve_factor outside [0, WAD)".into());
        }
        Ok(())
    }
}
