//! Allocation sanity checks.
//!
//! A submission is never rejected: it is flagged, persisted, and the
//! aggregator turns a non-`Ok` flag into the request's floor score. That
//! keeps a malformed or malicious response from ever aborting the scoring
//! pass for everyone else.

use serde::{Deserialize, Serialize};

use crate::{Allocation, AllocationRequest, Amount, RawAllocation};

/// Outcome of checking one raw allocation against its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFlag {
    Ok,
    /// Amounts sum past the request's `total_assets`.
    OverCapital,
    /// References a pool absent from the snapshot.
    UnknownPool,
    /// At least one negative amount.
    NegativeAmount,
}

impl ValidationFlag {
    pub fn is_ok(self) -> bool {
        self == ValidationFlag::Ok
    }
}

/// Check a raw allocation against its request. Pure.
///
/// When several violations coexist the most structural one wins:
/// `NegativeAmount` over `UnknownPool` over `OverCapital`. Downstream
/// treatment is identical either way (floor score), so precedence only
/// affects what operators see in stored flags.
pub fn validate(raw: &RawAllocation, request: &AllocationRequest) -> ValidationFlag {
    if raw.values().any(|amount| *amount < 0) {
        return ValidationFlag::NegativeAmount;
    }
    if raw.keys().any(|pool| !request.pools.contains_key(pool)) {
        return ValidationFlag::UnknownPool;
    }
    let mut sum: Amount = 0;
    for amount in raw.values() {
        sum = match sum.checked_add(*amount as Amount) {
            Some(total) => total,
            // Cannot even be represented; certainly over the ceiling.
            None => return ValidationFlag::OverCapital,
        };
    }
    if sum > request.total_assets {
        ValidationFlag::OverCapital
    } else {
        ValidationFlag::Ok
    }
}

/// Convert a raw allocation that passed [`validate`] into typed amounts,
/// dropping zero entries.
pub fn to_allocation(raw: &RawAllocation) -> Allocation {
    raw.iter()
        .filter(|(_, amount)| **amount > 0)
        .map(|(pool, amount)| (pool.clone(), *amount as Amount))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolKind, SyntheticPool};
    use crate::{PoolId, RequestId, RequestType, SimParams};
    use std::collections::BTreeMap;

    fn request() -> AllocationRequest {
        let pool = SyntheticPool {
            base_rate: 0.01,
            base_slope: 0.02,
            kink_slope: 0.2,
            optimal_util_rate: 0.8,
            borrow_amount: 0.5,
            reserve_size: 1.0,
            reserve_factor: 0.0,
        };
        let mut pools = BTreeMap::new();
        pools.insert(PoolId::new("0xaa"), PoolKind::Synthetic(pool.clone()));
        pools.insert(PoolId::new("0xbb"), PoolKind::Synthetic(pool));
        AllocationRequest {
            id: RequestId::new("req-v"),
            request_type: RequestType::Synthetic,
            total_assets: 1_000,
            pools,
            sim_params: Some(SimParams {
                horizon_steps: 5,
                stochasticity: 0.0,
            }),
            metadata: BTreeMap::new(),
            created_at: 0,
        }
    }

    fn raw(entries: &[(&str, i128)]) -> RawAllocation {
        entries
            .iter()
            .map(|(pool, amount)| (PoolId::new(*pool), *amount))
            .collect()
    }

    #[test]
    fn split_within_capital_is_ok() {
        let allocation = raw(&[("0xaa", 600), ("0xbb", 400)]);
        assert_eq!(validate(&allocation, &request()), ValidationFlag::Ok);
    }

    #[test]
    fn exact_capital_is_ok() {
        let allocation = raw(&[("0xaa", 1_000)]);
        assert_eq!(validate(&allocation, &request()), ValidationFlag::Ok);
    }

    #[test]
    fn one_unit_over_capital_is_flagged() {
        let allocation = raw(&[("0xaa", 600), ("0xbb", 401)]);
        assert_eq!(
            validate(&allocation, &request()),
            ValidationFlag::OverCapital
        );
    }

    #[test]
    fn unknown_pool_is_flagged() {
        let allocation = raw(&[("0xaa", 100), ("0xcc", 100)]);
        assert_eq!(
            validate(&allocation, &request()),
            ValidationFlag::UnknownPool
        );
    }

    #[test]
    fn negative_amount_wins_precedence() {
        // Negative, unknown pool, and over-capital at once.
        let allocation = raw(&[("0xaa", -5), ("0xcc", 2_000)]);
        assert_eq!(
            validate(&allocation, &request()),
            ValidationFlag::NegativeAmount
        );
    }

    #[test]
    fn unknown_pool_outranks_over_capital() {
        let allocation = raw(&[("0xcc", 2_000)]);
        assert_eq!(
            validate(&allocation, &request()),
            ValidationFlag::UnknownPool
        );
    }

    #[test]
    fn empty_allocation_is_ok() {
        assert_eq!(validate(&raw(&[]), &request()), ValidationFlag::Ok);
    }

    #[test]
    fn astronomical_sum_is_over_capital() {
        let allocation = raw(&[("0xaa", i128::MAX), ("0xbb", i128::MAX)]);
        assert_eq!(
            validate(&allocation, &request()),
            ValidationFlag::OverCapital
        );
    }

    #[test]
    fn conversion_drops_zero_entries() {
        let allocation = to_allocation(&raw(&[("0xaa", 500), ("0xbb", 0)]));
        assert_eq!(allocation.len(), 1);
        assert_eq!(allocation[&PoolId::new("0xaa")], 500);
    }
}
