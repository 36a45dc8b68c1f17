//! Durable request lifecycle store.
//!
//! Two implementations share one set of record-level guards: an
//! in-memory store for tests and demos, and a file store writing one
//! JSON record per request with atomic temp-file renames. All lifecycle
//! rules live on [`StoredRequest`], so both stores enforce exactly the
//! same transitions.
//!
//! Scoring uses a claim lease with a fencing token: a sweep claims a
//! request, scores it, and commits with the token it was handed. If the
//! claimant stalls past its lease, another sweep may re-claim; the stale
//! claimant's later commit is rejected because its token no longer
//! matches. Committed scores are immutable, so scoring happens at most
//! once per request no matter how often a crashed pass is retried.
//!
//! Timestamps are passed in by the caller rather than read from the
//! clock, which keeps every store operation replayable in tests.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::lifecycle::RequestState;
use crate::{
    AllocationRequest, EngineError, MinerId, MinerScore, RequestId, Result, Submission,
    UnixMillis, MAX_MINERS_PER_REQUEST,
};

const RECORD_VERSION_V1: u32 = 1;

// =============================================================================
// Records and guards
// =============================================================================

/// Active scoring claim on one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringClaim {
    /// Fencing token; a commit must present the latest one issued.
    pub token: u64,
    pub expires_at: UnixMillis,
}

/// Everything persisted about one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRequest {
    pub record_version: u32,
    pub request: AllocationRequest,
    pub state: RequestState,
    /// Miner set the request was dispatched to; fixed at dispatch time.
    pub miners: Vec<MinerId>,
    pub submissions: BTreeMap<MinerId, Submission>,
    pub scores: BTreeMap<MinerId, MinerScore>,
    pub dispatched_at: Option<UnixMillis>,
    pub frozen_at: Option<UnixMillis>,
    /// Set at freeze; scoring may only start once this has passed.
    pub scoring_period_end: Option<UnixMillis>,
    pub scored_at: Option<UnixMillis>,
    /// Reason the request was declared unscoreable.
    pub fault: Option<String>,
    pub claim: Option<ScoringClaim>,
    /// Monotone claim counter; persisted so tokens keep increasing
    /// across restarts.
    pub claim_seq: u64,
}

impl StoredRequest {
    pub fn new(request: AllocationRequest) -> Self {
        Self {
            record_version: RECORD_VERSION_V1,
            request,
            state: RequestState::Created,
            miners: Vec::new(),
            submissions: BTreeMap::new(),
            scores: BTreeMap::new(),
            dispatched_at: None,
            frozen_at: None,
            scoring_period_end: None,
            scored_at: None,
            fault: None,
            claim: None,
            claim_seq: 0,
        }
    }

    fn guard(&self, next: RequestState, action: &'static str) -> Result<()> {
        if self.state.can_transition(next) {
            Ok(())
        } else {
            Err(EngineError::WrongState {
                id: self.request.id.clone(),
                state: self.state,
                action,
            })
        }
    }

    pub fn mark_dispatched(&mut self, miners: Vec<MinerId>, now: UnixMillis) -> Result<()> {
        self.guard(RequestState::Dispatched, "dispatch")?;
        if miners.is_empty() {
            return Err(EngineError::InvalidRequest {
                id: self.request.id.clone(),
                reason: "dispatched to an empty miner set".into(),
            });
        }
        if miners.len() > MAX_MINERS_PER_REQUEST {
            return Err(EngineError::InvalidRequest {
                id: self.request.id.clone(),
                reason: format!(
                    "{} miners exceeds cap of {MAX_MINERS_PER_REQUEST}",
                    miners.len()
                ),
            });
        }
        self.miners = miners;
        self.dispatched_at = Some(now);
        self.state = RequestState::Dispatched;
        Ok(())
    }

    pub fn begin_collection(&mut self) -> Result<()> {
        self.guard(RequestState::Collecting, "begin collection")?;
        self.state = RequestState::Collecting;
        Ok(())
    }

    /// Record one miner's response.
    ///
    /// Submissions from miners outside the dispatched set, and repeat
    /// submissions from the same miner, are dropped with a warning: the
    /// first recorded response is the one that scores.
    pub fn record_submission(&mut self, miner: &MinerId, submission: Submission) -> Result<()> {
        if !self.state.accepts_submissions() {
            return Err(EngineError::WrongState {
                id: self.request.id.clone(),
                state: self.state,
                action: "record submission",
            });
        }
        if !self.miners.contains(miner) {
            warn!(request = %self.request.id, miner = %miner, "submission from undispatched miner dropped");
            return Ok(());
        }
        if self.submissions.contains_key(miner) {
            warn!(request = %self.request.id, miner = %miner, "repeat submission dropped; first response stands");
            return Ok(());
        }
        self.submissions.insert(miner.clone(), submission);
        Ok(())
    }

    /// Lock the submission set and start the scoring period.
    pub fn freeze(&mut self, now: UnixMillis, scoring_horizon_ms: i64) -> Result<()> {
        self.guard(RequestState::Frozen, "freeze")?;
        self.frozen_at = Some(now);
        self.scoring_period_end = Some(now.saturating_add(scoring_horizon_ms.max(0)));
        self.state = RequestState::Frozen;
        Ok(())
    }

    /// Whether the scoring period has elapsed for a request awaiting it.
    ///
    /// Covers `Frozen` as well as `ScoringPending`: a crash between the
    /// freeze and the pending move leaves a record in `Frozen`, and the
    /// sweep finishes the move for it.
    pub fn scoring_due(&self, now: UnixMillis) -> bool {
        matches!(
            self.state,
            RequestState::Frozen | RequestState::ScoringPending
        ) && self.scoring_period_end.map(|end| now >= end).unwrap_or(false)
    }

    /// Move a frozen request into its scoring wait; follows `freeze`
    /// immediately. Claims are what gate on the period end, not this.
    pub fn make_scoring_pending(&mut self) -> Result<()> {
        self.guard(RequestState::ScoringPending, "mark scoring pending")?;
        if self.scoring_period_end.is_none() {
            return Err(EngineError::Store(format!(
                "request {} frozen without a scoring period end",
                self.request.id
            )));
        }
        self.state = RequestState::ScoringPending;
        Ok(())
    }

    /// Take the scoring claim, returning the fencing token.
    ///
    /// Only a `ScoringPending` request whose scoring period has ended is
    /// claimable; the guard lives here so no caller can score early.
    pub fn claim(&mut self, now: UnixMillis, lease_ms: i64) -> Result<u64> {
        if self.state != RequestState::ScoringPending {
            return Err(EngineError::NotClaimable {
                id: self.request.id.clone(),
                reason: format!("state is {}", self.state),
            });
        }
        let end = self.scoring_period_end.ok_or_else(|| {
            EngineError::Store(format!(
                "request {} pending without a scoring period end",
                self.request.id
            ))
        })?;
        if now < end {
            return Err(EngineError::NotClaimable {
                id: self.request.id.clone(),
                reason: format!("scoring period open until {end}"),
            });
        }
        if let Some(held) = &self.claim {
            if held.expires_at > now {
                return Err(EngineError::NotClaimable {
                    id: self.request.id.clone(),
                    reason: format!("claim held until {}", held.expires_at),
                });
            }
            debug!(request = %self.request.id, token = held.token, "expired claim superseded");
        }
        self.claim_seq += 1;
        let token = self.claim_seq;
        self.claim = Some(ScoringClaim {
            token,
            expires_at: now.saturating_add(lease_ms.max(0)),
        });
        Ok(token)
    }

    /// Give the claim back without scoring; stale tokens are ignored so a
    /// late release can never drop a newer claimant's lease.
    pub fn release_claim(&mut self, token: u64) {
        if self.claim.map(|c| c.token) == Some(token) {
            self.claim = None;
        }
    }

    pub fn commit_scores(
        &mut self,
        token: u64,
        scores: BTreeMap<MinerId, MinerScore>,
        now: UnixMillis,
    ) -> Result<()> {
        match self.state {
            RequestState::Scored => {
                return Err(EngineError::AlreadyScored {
                    id: self.request.id.clone(),
                });
            }
            RequestState::ScoringPending => {}
            _ => {
                return Err(EngineError::WrongState {
                    id: self.request.id.clone(),
                    state: self.state,
                    action: "commit scores",
                });
            }
        }
        match &self.claim {
            Some(held) if held.token == token => {}
            _ => {
                return Err(EngineError::ClaimLost {
                    id: self.request.id.clone(),
                });
            }
        }
        self.scores = scores;
        self.scored_at = Some(now);
        self.claim = None;
        self.state = RequestState::Scored;
        Ok(())
    }

    pub fn mark_unscoreable(&mut self, reason: &str) -> Result<()> {
        self.guard(RequestState::Unscoreable, "mark unscoreable")?;
        self.fault = Some(reason.to_string());
        self.claim = None;
        self.state = RequestState::Unscoreable;
        Ok(())
    }

    /// Whether the request has sat past its scoring window and should be
    /// declared unscoreable by the sweep.
    pub fn overdue(&self, now: UnixMillis, scoring_window_ms: i64) -> bool {
        matches!(
            self.state,
            RequestState::Frozen | RequestState::ScoringPending
        ) && self
            .scoring_period_end
            .map(|end| now > end.saturating_add(scoring_window_ms.max(0)))
            .unwrap_or(false)
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Persistence boundary for request lifecycle records.
pub trait RequestStore: Send + Sync {
    fn create(&self, request: AllocationRequest) -> Result<()>;
    fn load(&self, id: &RequestId) -> Result<StoredRequest>;
    /// Ids of all non-terminal requests, sorted.
    fn list_active(&self) -> Result<Vec<RequestId>>;
    fn mark_dispatched(&self, id: &RequestId, miners: Vec<MinerId>, now: UnixMillis)
        -> Result<()>;
    fn begin_collection(&self, id: &RequestId) -> Result<()>;
    fn record_submission(
        &self,
        id: &RequestId,
        miner: &MinerId,
        submission: Submission,
    ) -> Result<()>;
    fn freeze(&self, id: &RequestId, now: UnixMillis, scoring_horizon_ms: i64) -> Result<()>;
    fn make_scoring_pending(&self, id: &RequestId) -> Result<()>;
    fn claim_for_scoring(&self, id: &RequestId, now: UnixMillis, lease_ms: i64) -> Result<u64>;
    fn release_claim(&self, id: &RequestId, token: u64) -> Result<()>;
    fn commit_scores(
        &self,
        id: &RequestId,
        token: u64,
        scores: BTreeMap<MinerId, MinerScore>,
        now: UnixMillis,
    ) -> Result<()>;
    fn mark_unscoreable(&self, id: &RequestId, reason: &str) -> Result<()>;
    /// Ids currently in `state`, sorted.
    fn requests_in_state(&self, state: RequestState) -> Result<Vec<RequestId>>;
    /// One miner's submissions received at or after `since`, ordered by
    /// receipt time then request id.
    fn submissions_by_miner(
        &self,
        miner: &MinerId,
        since: UnixMillis,
    ) -> Result<Vec<(RequestId, Submission)>>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Map-backed store for tests, demos and single-process runs.
#[derive(Default)]
pub struct MemoryRequestStore {
    records: RwLock<HashMap<RequestId, StoredRequest>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        id: &RequestId,
        f: impl FnOnce(&mut StoredRequest) -> Result<T>,
    ) -> Result<T> {
        let mut records = self
            .records
            .write()
            .map_err(|_| EngineError::Store("request map lock poisoned".into()))?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownRequest(id.clone()))?;
        f(record)
    }
}

impl RequestStore for MemoryRequestStore {
    fn create(&self, request: AllocationRequest) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| EngineError::Store("request map lock poisoned".into()))?;
        if records.contains_key(&request.id) {
            return Err(EngineError::Store(format!(
                "request {} already exists",
                request.id
            )));
        }
        records.insert(request.id.clone(), StoredRequest::new(request));
        Ok(())
    }

    fn load(&self, id: &RequestId) -> Result<StoredRequest> {
        let records = self
            .records
            .read()
            .map_err(|_| EngineError::Store("request map lock poisoned".into()))?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRequest(id.clone()))
    }

    fn list_active(&self) -> Result<Vec<RequestId>> {
        let records = self
            .records
            .read()
            .map_err(|_| EngineError::Store("request map lock poisoned".into()))?;
        let mut ids: Vec<RequestId> = records
            .values()
            .filter(|record| !record.state.is_terminal())
            .map(|record| record.request.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn mark_dispatched(
        &self,
        id: &RequestId,
        miners: Vec<MinerId>,
        now: UnixMillis,
    ) -> Result<()> {
        self.with_record(id, |record| record.mark_dispatched(miners, now))
    }

    fn begin_collection(&self, id: &RequestId) -> Result<()> {
        self.with_record(id, |record| record.begin_collection())
    }

    fn record_submission(
        &self,
        id: &RequestId,
        miner: &MinerId,
        submission: Submission,
    ) -> Result<()> {
        self.with_record(id, |record| record.record_submission(miner, submission))
    }

    fn freeze(&self, id: &RequestId, now: UnixMillis, scoring_horizon_ms: i64) -> Result<()> {
        self.with_record(id, |record| record.freeze(now, scoring_horizon_ms))
    }

    fn make_scoring_pending(&self, id: &RequestId) -> Result<()> {
        self.with_record(id, |record| record.make_scoring_pending())
    }

    fn claim_for_scoring(&self, id: &RequestId, now: UnixMillis, lease_ms: i64) -> Result<u64> {
        self.with_record(id, |record| record.claim(now, lease_ms))
    }

    fn release_claim(&self, id: &RequestId, token: u64) -> Result<()> {
        self.with_record(id, |record| {
            record.release_claim(token);
            Ok(())
        })
    }

    fn commit_scores(
        &self,
        id: &RequestId,
        token: u64,
        scores: BTreeMap<MinerId, MinerScore>,
        now: UnixMillis,
    ) -> Result<()> {
        self.with_record(id, |record| record.commit_scores(token, scores, now))
    }

    fn mark_unscoreable(&self, id: &RequestId, reason: &str) -> Result<()> {
        self.with_record(id, |record| record.mark_unscoreable(reason))
    }

    fn requests_in_state(&self, state: RequestState) -> Result<Vec<RequestId>> {
        let records = self
            .records
            .read()
            .map_err(|_| EngineError::Store("request map lock poisoned".into()))?;
        let mut ids: Vec<RequestId> = records
            .values()
            .filter(|record| record.state == state)
            .map(|record| record.request.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn submissions_by_miner(
        &self,
        miner: &MinerId,
        since: UnixMillis,
    ) -> Result<Vec<(RequestId, Submission)>> {
        let records = self
            .records
            .read()
            .map_err(|_| EngineError::Store("request map lock poisoned".into()))?;
        let mut rows: Vec<(RequestId, Submission)> = records
            .values()
            .filter_map(|record| {
                record
                    .submissions
                    .get(miner)
                    .filter(|s| s.received_at >= since)
                    .map(|s| (record.request.id.clone(), s.clone()))
            })
            .collect();
        rows.sort_by(|a, b| {
            a.1.received_at
                .cmp(&b.1.received_at)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(rows)
    }
}

// =============================================================================
// File store
// =============================================================================

/// One JSON record per request under `<root>/requests/`, written with a
/// temp-file rename so records are never observable half-written.
///
/// Mutations are serialized through a process-local mutex; the store
/// assumes a single writing process per root directory. Request ids must
/// be filesystem-safe (ASCII alphanumerics, `-`, `_`, `.`), which every
/// generated id satisfies.
pub struct FileRequestStore {
    root: PathBuf,
    write_gate: Mutex<()>,
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::StoreIo {
        path: path.display().to_string(),
        source,
    }
}

fn file_safe_id(id: &RequestId) -> Result<&str> {
    let raw = id.as_str();
    let ok = !raw.is_empty()
        && raw.len() <= 128
        && !raw.starts_with('.')
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(raw)
    } else {
        Err(EngineError::Store(format!(
            "request id {raw:?} is not filesystem-safe"
        )))
    }
}

impl FileRequestStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let requests = root.join("requests");
        fs::create_dir_all(&requests).map_err(|e| io_err(&requests, e))?;
        Ok(Self {
            root,
            write_gate: Mutex::new(()),
        })
    }

    fn request_path(&self, id: &RequestId) -> Result<PathBuf> {
        let name = file_safe_id(id)?;
        Ok(self.root.join("requests").join(format!("{name}.json")))
    }

    fn read_record(&self, id: &RequestId) -> Result<StoredRequest> {
        let path = self.request_path(id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::UnknownRequest(id.clone()));
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        let record: StoredRequest =
            serde_json::from_slice(&bytes).map_err(|source| EngineError::StoreCorrupt {
                path: path.display().to_string(),
                source,
            })?;
        if record.record_version != RECORD_VERSION_V1 {
            return Err(EngineError::Store(format!(
                "unsupported record version {} at {}",
                record.record_version,
                path.display()
            )));
        }
        Ok(record)
    }

    fn write_record(&self, record: &StoredRequest) -> Result<()> {
        let path = self.request_path(&record.request.id)?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| EngineError::Store(format!("encode record: {e}")))?;
        atomic_write(&path, &bytes).map_err(|e| io_err(&path, e))
    }

    fn with_record<T>(
        &self,
        id: &RequestId,
        f: impl FnOnce(&mut StoredRequest) -> Result<T>,
    ) -> Result<T> {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| EngineError::Store("file store write gate poisoned".into()))?;
        let mut record = self.read_record(id)?;
        let out = f(&mut record)?;
        self.write_record(&record)?;
        Ok(out)
    }

    /// Read every record under `requests/`, skipping unreadable files.
    fn scan_records(&self) -> Result<Vec<StoredRequest>> {
        let dir = self.root.join("requests");
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            {
                Some(record) => records.push(record),
                None => {
                    warn!(path = %path.display(), "skipping unreadable request record");
                }
            }
        }
        Ok(records)
    }
}

impl RequestStore for FileRequestStore {
    fn create(&self, request: AllocationRequest) -> Result<()> {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| EngineError::Store("file store write gate poisoned".into()))?;
        let path = self.request_path(&request.id)?;
        if path.exists() {
            return Err(EngineError::Store(format!(
                "request {} already exists",
                request.id
            )));
        }
        self.write_record(&StoredRequest::new(request))
    }

    fn load(&self, id: &RequestId) -> Result<StoredRequest> {
        self.read_record(id)
    }

    fn list_active(&self) -> Result<Vec<RequestId>> {
        let mut ids: Vec<RequestId> = self
            .scan_records()?
            .into_iter()
            .filter(|record| !record.state.is_terminal())
            .map(|record| record.request.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn mark_dispatched(
        &self,
        id: &RequestId,
        miners: Vec<MinerId>,
        now: UnixMillis,
    ) -> Result<()> {
        self.with_record(id, |record| record.mark_dispatched(miners, now))
    }

    fn begin_collection(&self, id: &RequestId) -> Result<()> {
        self.with_record(id, |record| record.begin_collection())
    }

    fn record_submission(
        &self,
        id: &RequestId,
        miner: &MinerId,
        submission: Submission,
    ) -> Result<()> {
        self.with_record(id, |record| record.record_submission(miner, submission))
    }

    fn freeze(&self, id: &RequestId, now: UnixMillis, scoring_horizon_ms: i64) -> Result<()> {
        self.with_record(id, |record| record.freeze(now, scoring_horizon_ms))
    }

    fn make_scoring_pending(&self, id: &RequestId) -> Result<()> {
        self.with_record(id, |record| record.make_scoring_pending())
    }

    fn claim_for_scoring(&self, id: &RequestId, now: UnixMillis, lease_ms: i64) -> Result<u64> {
        self.with_record(id, |record| record.claim(now, lease_ms))
    }

    fn release_claim(&self, id: &RequestId, token: u64) -> Result<()> {
        self.with_record(id, |record| {
            record.release_claim(token);
            Ok(())
        })
    }

    fn commit_scores(
        &self,
        id: &RequestId,
        token: u64,
        scores: BTreeMap<MinerId, MinerScore>,
        now: UnixMillis,
    ) -> Result<()> {
        self.with_record(id, |record| record.commit_scores(token, scores, now))
    }

    fn mark_unscoreable(&self, id: &RequestId, reason: &str) -> Result<()> {
        self.with_record(id, |record| record.mark_unscoreable(reason))
    }

    fn requests_in_state(&self, state: RequestState) -> Result<Vec<RequestId>> {
        let mut ids: Vec<RequestId> = self
            .scan_records()?
            .into_iter()
            .filter(|record| record.state == state)
            .map(|record| record.request.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn submissions_by_miner(
        &self,
        miner: &MinerId,
        since: UnixMillis,
    ) -> Result<Vec<(RequestId, Submission)>> {
        let mut rows = Vec::new();
        for mut record in self.scan_records()? {
            if let Some(submission) = record.submissions.remove(miner) {
                if submission.received_at >= since {
                    rows.push((record.request.id, submission));
                }
            }
        }
        rows.sort_by(|a, b| {
            a.1.received_at
                .cmp(&b.1.received_at)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(rows)
    }
}
