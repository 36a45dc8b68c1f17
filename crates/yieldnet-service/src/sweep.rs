//! The periodic scoring sweep.
//!
//! A single sweep owns every scoring-side transition. Each pass walks
//! the active requests and, per request:
//!
//! - retires it as unscoreable when its scoring window has been overrun,
//! - finishes the move to scoring-pending if a crash left it frozen,
//! - once its scoring period has elapsed, claims it, computes scores,
//!   commits them and publishes weights.
//!
//! Scoring runs under a leased claim with a fencing token, so a stalled
//! or crashed pass can never double-score: the commit either presents
//! the latest token issued or is rejected. A failed pass releases its
//! claim and the next sweep retries from the persisted record.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use yieldnet_core::config::EngineConfig;
use yieldnet_core::metrics::{EngineMetrics, StageTimer};
use yieldnet_core::store::RequestStore;
use yieldnet_core::{now_ms, EngineError, RequestId, RequestState, RequestType, UnixMillis};

use crate::components::{ChainDataSource, WeightSink};
use crate::pipeline;
use crate::{Result, ServiceError};

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scored: usize,
    pub unscoreable: usize,
    /// Claims released after a failed attempt; retried next pass.
    pub retried: usize,
    pub errors: usize,
}

/// The periodic pass driving every pending request to a terminal state.
pub struct ScoringSweep {
    store: Arc<dyn RequestStore>,
    chain: Arc<dyn ChainDataSource>,
    weights: Arc<dyn WeightSink>,
    metrics: Arc<EngineMetrics>,
    config: EngineConfig,
}

impl ScoringSweep {
    pub fn new(
        store: Arc<dyn RequestStore>,
        chain: Arc<dyn ChainDataSource>,
        weights: Arc<dyn WeightSink>,
        metrics: Arc<EngineMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            chain,
            weights,
            metrics,
            config,
        }
    }

    /// Run sweep passes every `sweep.interval_ms` until `shutdown` flips
    /// to true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.sweep.interval_ms.max(1) as u64);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.metrics.sweep_passes.inc();
                    match self.sweep_once().await {
                        Ok(report) => debug!(
                            scored = report.scored,
                            unscoreable = report.unscoreable,
                            retried = report.retried,
                            errors = report.errors,
                            "sweep pass"
                        ),
                        Err(e) => {
                            self.metrics.sweep_errors.inc();
                            warn!(error = %e, "sweep pass failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scoring sweep stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over the active requests. Per-request faults are
    /// absorbed and counted; only a store listing failure aborts.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = now_ms();
        let active = self.store.list_active()?;
        self.metrics.active_requests.set(active.len() as u64);

        let mut report = SweepReport::default();
        let mut claimable = Vec::new();
        for id in active {
            let record = match self.store.load(&id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(request = %id, error = %e, "skipping unreadable record");
                    self.metrics.sweep_errors.inc();
                    report.errors += 1;
                    continue;
                }
            };

            if record.overdue(now, self.config.sweep.scoring_window_ms) {
                match self.store.mark_unscoreable(&id, "scoring window overrun") {
                    Ok(()) => {
                        info!(request = %id, "scoring window overrun, request retired");
                        self.metrics.requests_unscoreable.inc();
                        report.unscoreable += 1;
                    }
                    Err(e) => {
                        warn!(request = %id, error = %e, "could not retire overdue request");
                        self.metrics.sweep_errors.inc();
                        report.errors += 1;
                    }
                }
                continue;
            }

            if record.state == RequestState::Frozen {
                // A crash between the freeze and the pending move left
                // this record frozen; finish the move here.
                if let Err(e) = self.store.make_scoring_pending(&id) {
                    warn!(request = %id, error = %e, "could not finish pending move");
                    self.metrics.sweep_errors.inc();
                    report.errors += 1;
                    continue;
                }
            }
            if record.scoring_due(now) {
                claimable.push(id);
            }
        }

        claimable.truncate(self.config.sweep.max_parallel_scoring);
        let outcomes = join_all(claimable.iter().map(|id| self.score_one(id, now))).await;
        for (id, outcome) in claimable.iter().zip(outcomes) {
            match outcome {
                Ok(true) => report.scored += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(request = %id, error = %e, "scoring attempt failed, will retry");
                    self.metrics.sweep_errors.inc();
                    report.retried += 1;
                }
            }
        }
        Ok(report)
    }

    /// Claim and score one pending request. `Ok(false)` means the claim
    /// was unavailable or another claimant's scores already stand.
    async fn score_one(&self, id: &RequestId, now: UnixMillis) -> Result<bool> {
        let lease_ms = self.config.sweep.claim_lease_ms;
        let token = match self.store.claim_for_scoring(id, now, lease_ms) {
            Ok(token) => token,
            Err(EngineError::NotClaimable { .. }) => {
                debug!(request = %id, "claim unavailable, leaving for a later pass");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        self.metrics.claims_taken.inc();
        self.metrics.scoring_in_flight.inc();
        let result = self.score_claimed(id, token, now).await;
        self.metrics.scoring_in_flight.dec();
        if result.is_err() {
            // Put the request back up for grabs; the next pass retries.
            if let Err(e) = self.store.release_claim(id, token) {
                warn!(request = %id, error = %e, "claim release failed");
            }
        }
        result
    }

    async fn score_claimed(&self, id: &RequestId, token: u64, now: UnixMillis) -> Result<bool> {
        let record = self.store.load(id)?;
        let observations = match record.request.request_type {
            RequestType::Organic => {
                let pools = record.request.pool_ids();
                Some(self.chain.observe(&pools).await?)
            }
            RequestType::Synthetic => None,
        };
        // Organic yield realizes over the span the allocations actually
        // sat on chain: freeze to now.
        let elapsed_ms = now.saturating_sub(record.frozen_at.unwrap_or(record.request.created_at));

        let config = self.config.clone();
        let scores = {
            let _timer = StageTimer::start(&self.metrics.scoring_pass_millis);
            tokio::task::spawn_blocking(move || {
                pipeline::score_claimed(&record, observations.as_ref(), elapsed_ms, &config)
            })
            .await
            .map_err(|e| ServiceError::Engine(EngineError::Store(format!("scoring task: {e}"))))??
        };

        match self.store.commit_scores(id, token, scores.clone(), now_ms()) {
            Ok(()) => {}
            Err(EngineError::AlreadyScored { .. }) => {
                // A fenced-out retry found the scores already committed;
                // whoever committed them also published.
                debug!(request = %id, "scores already committed");
                self.metrics.claims_lost.inc();
                return Ok(false);
            }
            Err(e @ EngineError::ClaimLost { .. }) => {
                self.metrics.claims_lost.inc();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
        self.metrics.requests_scored.inc();
        self.weights.publish(id, &scores).await?;
        info!(request = %id, miners = scores.len(), "request scored");
        Ok(true)
    }
}
