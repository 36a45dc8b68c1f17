//! Copy-detection penalties.
//!
//! Allocations are compared as weight vectors over the request's pool set
//! (fraction of total capital per pool, absent pools padded with zero).
//! Each miner's penalty factor depends on its distance to the nearest
//! other submission: far enough away earns factor 1.0, and inside the
//! threshold the factor shrinks linearly down to a floor. The factor is a
//! pure function of the submission set, so two bit-identical allocations
//! are penalized symmetrically no matter which arrived first.
//!
//! Miners whose submissions were flagged at validation never reach this
//! stage; their floor score is decided upstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::SimilarityConfig;
use crate::{Allocation, Amount, MinerId, PoolId};

/// How submission distance is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Euclidean distance between weight vectors, scaled by `sqrt(2)` so
    /// two disjoint full-capital allocations sit at exactly 1.0.
    NormalizedEuclidean,
    /// One minus cosine similarity; catches same-shape allocations that
    /// differ only in how much capital was deployed.
    Cosine,
}

/// Capital fractions over `pool_ids`, in the given order.
pub fn weight_vector(allocation: &Allocation, pool_ids: &[PoolId], total_assets: Amount) -> Vec<f64> {
    if total_assets == 0 {
        return vec![0.0; pool_ids.len()];
    }
    let total = total_assets as f64;
    pool_ids
        .iter()
        .map(|pool_id| {
            allocation
                .get(pool_id)
                .map(|amount| *amount as f64 / total)
                .unwrap_or(0.0)
        })
        .collect()
}

/// Distance between two equal-length weight vectors, in [0, 1].
pub fn distance(a: &[f64], b: &[f64], metric: DistanceMetric) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    match metric {
        DistanceMetric::NormalizedEuclidean => {
            let sum_sq: f64 = a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum();
            (sum_sq.sqrt() / std::f64::consts::SQRT_2).min(1.0)
        }
        DistanceMetric::Cosine => {
            let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm_a == 0.0 && norm_b == 0.0 {
                0.0 // two empty allocations are identical
            } else if norm_a == 0.0 || norm_b == 0.0 {
                1.0
            } else {
                (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 1.0)
            }
        }
    }
}

/// Penalty factor per miner, keyed by nearest-neighbour distance.
///
/// Factors are in `[floor, 1.0]`: 1.0 at or beyond the threshold, scaled
/// linearly below it, never under the floor. A lone submission (or an
/// empty set) is never penalized.
pub fn penalty_factors(
    allocations: &BTreeMap<MinerId, Allocation>,
    pool_ids: &[PoolId],
    total_assets: Amount,
    config: &SimilarityConfig,
) -> BTreeMap<MinerId, f64> {
    let vectors: Vec<(&MinerId, Vec<f64>)> = allocations
        .iter()
        .map(|(miner, allocation)| (miner, weight_vector(allocation, pool_ids, total_assets)))
        .collect();

    let mut factors = BTreeMap::new();
    for (i, (miner, vector)) in vectors.iter().enumerate() {
        let mut nearest = f64::INFINITY;
        for (j, (_, other)) in vectors.iter().enumerate() {
            if i != j {
                nearest = nearest.min(distance(vector, other, config.metric));
            }
        }
        // A lone miner keeps nearest = INF and lands in the no-penalty arm.
        let factor = if nearest >= config.threshold {
            1.0
        } else {
            (nearest / config.threshold).max(config.floor)
        };
        factors.insert((*miner).clone(), factor);
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::wad::WAD;

    fn pools(ids: &[&str]) -> Vec<PoolId> {
        ids.iter().map(|id| PoolId::new(*id)).collect()
    }

    fn alloc(entries: &[(&str, u128)]) -> Allocation {
        entries
            .iter()
            .map(|(id, amount)| (PoolId::new(*id), *amount))
            .collect()
    }

    fn config() -> SimilarityConfig {
        SimilarityConfig {
            metric: DistanceMetric::NormalizedEuclidean,
            threshold: 0.1,
            floor: 0.25,
        }
    }

    #[test]
    fn identical_allocations_both_hit_the_floor() {
        let ids = pools(&["0xaa", "0xbb"]);
        let copy = alloc(&[("0xaa", WAD / 2), ("0xbb", WAD / 2)]);
        let mut submissions = BTreeMap::new();
        submissions.insert(MinerId::new("m1"), copy.clone());
        submissions.insert(MinerId::new("m2"), copy);

        let factors = penalty_factors(&submissions, &ids, WAD, &config());
        assert_eq!(factors[&MinerId::new("m1")], 0.25);
        assert_eq!(factors[&MinerId::new("m2")], 0.25);
    }

    #[test]
    fn disjoint_full_capital_allocations_are_unpenalized() {
        let ids = pools(&["0xaa", "0xbb"]);
        let mut submissions = BTreeMap::new();
        submissions.insert(MinerId::new("m1"), alloc(&[("0xaa", WAD)]));
        submissions.insert(MinerId::new("m2"), alloc(&[("0xbb", WAD)]));

        let factors = penalty_factors(&submissions, &ids, WAD, &config());
        assert_eq!(factors[&MinerId::new("m1")], 1.0);
        assert_eq!(factors[&MinerId::new("m2")], 1.0);
    }

    #[test]
    fn lone_submission_is_never_penalized() {
        let ids = pools(&["0xaa"]);
        let mut submissions = BTreeMap::new();
        submissions.insert(MinerId::new("m1"), alloc(&[("0xaa", WAD)]));
        let factors = penalty_factors(&submissions, &ids, WAD, &config());
        assert_eq!(factors[&MinerId::new("m1")], 1.0);
    }

    #[test]
    fn near_copies_scale_between_floor_and_one() {
        // Weights (0.55, 0.45) vs (0.50, 0.50): distance 0.05, half the
        // threshold, so the factor is exactly 0.5.
        let ids = pools(&["0xaa", "0xbb"]);
        let mut submissions = BTreeMap::new();
        submissions.insert(
            MinerId::new("m1"),
            alloc(&[("0xaa", 55 * WAD / 100), ("0xbb", 45 * WAD / 100)]),
        );
        submissions.insert(
            MinerId::new("m2"),
            alloc(&[("0xaa", WAD / 2), ("0xbb", WAD / 2)]),
        );

        let factors = penalty_factors(&submissions, &ids, WAD, &config());
        let factor = factors[&MinerId::new("m1")];
        assert!((factor - 0.5).abs() < 1e-9, "factor {factor}");
        assert_eq!(factors[&MinerId::new("m1")], factors[&MinerId::new("m2")]);
    }

    #[test]
    fn distance_at_the_threshold_is_not_penalized() {
        // Distance exactly 0.1: (0.6, 0.4) vs (0.5, 0.5) gives
        // sqrt(0.02)/sqrt(2) = 0.1.
        let ids = pools(&["0xaa", "0xbb"]);
        let mut submissions = BTreeMap::new();
        submissions.insert(
            MinerId::new("m1"),
            alloc(&[("0xaa", 6 * WAD / 10), ("0xbb", 4 * WAD / 10)]),
        );
        submissions.insert(
            MinerId::new("m2"),
            alloc(&[("0xaa", WAD / 2), ("0xbb", WAD / 2)]),
        );

        let factors = penalty_factors(&submissions, &ids, WAD, &config());
        for factor in factors.values() {
            assert!(*factor > 0.999, "factor {factor}");
        }
    }

    #[test]
    fn absent_pools_pad_with_zero_weight() {
        let ids = pools(&["0xaa", "0xbb", "0xcc"]);
        let vector = weight_vector(&alloc(&[("0xbb", WAD / 4)]), &ids, WAD);
        assert_eq!(vector, vec![0.0, 0.25, 0.0]);
    }

    #[test]
    fn cosine_catches_scaled_copies() {
        // Same shape at half the capital: cosine sees a copy, euclidean
        // does not.
        let ids = pools(&["0xaa", "0xbb"]);
        let full = alloc(&[("0xaa", WAD / 2), ("0xbb", WAD / 2)]);
        let half = alloc(&[("0xaa", WAD / 4), ("0xbb", WAD / 4)]);
        let full_vec = weight_vector(&full, &ids, WAD);
        let half_vec = weight_vector(&half, &ids, WAD);

        assert!(distance(&full_vec, &half_vec, DistanceMetric::Cosine) < 1e-12);
        assert!(distance(&full_vec, &half_vec, DistanceMetric::NormalizedEuclidean) > 0.1);
    }

    #[test]
    fn third_party_cannot_lift_a_copied_pair() {
        // A distant third submission must not change the factor of the
        // two copies; nearest-neighbour distance is what counts.
        let ids = pools(&["0xaa", "0xbb"]);
        let copy = alloc(&[("0xaa", WAD / 2), ("0xbb", WAD / 2)]);
        let mut submissions = BTreeMap::new();
        submissions.insert(MinerId::new("m1"), copy.clone());
        submissions.insert(MinerId::new("m2"), copy);
        submissions.insert(MinerId::new("m3"), alloc(&[("0xaa", WAD)]));

        let factors = penalty_factors(&submissions, &ids, WAD, &config());
        assert_eq!(factors[&MinerId::new("m1")], 0.25);
        assert_eq!(factors[&MinerId::new("m2")], 0.25);
        assert_eq!(factors[&MinerId::new("m3")], 1.0);
    }

    proptest! {
        #[test]
        fn factors_are_invariant_under_miner_relabeling(
            weights in proptest::collection::vec(
                proptest::collection::vec(0u64..=1_000, 3),
                2..6,
            ),
        ) {
            let ids = pools(&["0xaa", "0xbb", "0xcc"]);
            let total = 4_000 * WAD;
            let to_alloc = |row: &Vec<u64>| -> Allocation {
                row.iter()
                    .enumerate()
                    .map(|(k, w)| (ids[k].clone(), *w as u128 * WAD))
                    .collect()
            };

            let mut forward = BTreeMap::new();
            let mut reversed = BTreeMap::new();
            for (i, row) in weights.iter().enumerate() {
                forward.insert(MinerId::new(format!("a{i}")), to_alloc(row));
                // Reverse-sorting names flips BTreeMap iteration order.
                reversed.insert(MinerId::new(format!("z{}", weights.len() - i)), to_alloc(row));
            }

            let cfg = config();
            let f = penalty_factors(&forward, &ids, total, &cfg);
            let r = penalty_factors(&reversed, &ids, total, &cfg);
            for (i, _) in weights.iter().enumerate() {
                let lhs = f[&MinerId::new(format!("a{i}"))];
                let rhs = r[&MinerId::new(format!("z{}", weights.len() - i))];
                prop_assert!((lhs - rhs).abs() < 1e-12);
            }
        }

        #[test]
        fn factors_stay_within_floor_and_one(
            weights in proptest::collection::vec(
                proptest::collection::vec(0u64..=1_000, 2),
                1..8,
            ),
        ) {
            let ids = pools(&["0xaa", "0xbb"]);
            let mut submissions = BTreeMap::new();
            for (i, row) in weights.iter().enumerate() {
                let allocation: Allocation = row
                    .iter()
                    .enumerate()
                    .map(|(k, w)| (ids[k].clone(), *w as u128 * WAD))
                    .collect();
                submissions.insert(MinerId::new(format!("m{i}")), allocation);
            }
            let cfg = config();
            for factor in penalty_factors(&submissions, &ids, 2_000 * WAD, &cfg).values() {
                prop_assert!(*factor >= cfg.floor - 1e-12);
                prop_assert!(*factor <= 1.0 + 1e-12);
            }
        }
    }
}
