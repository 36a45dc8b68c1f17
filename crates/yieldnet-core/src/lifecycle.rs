//! Request lifecycle states.
//!
//! A request moves strictly forward: created, dispatched to the miner
//! set, collecting responses, frozen (submission set immutable), pending
//! the end of its scoring period, scored. `Unscoreable` is the terminal
//! escape hatch for fatal faults; both terminal states accept no further
//! transitions. The store enforces this table on every mutation, so a
//! crashed-and-retried step can never move a request backwards.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Persisted, not yet sent to any miner.
    Created,
    /// Sent to the miner set; responses may arrive.
    Dispatched,
    /// Response window open; submissions are being recorded.
    Collecting,
    /// Submission set locked at the response deadline.
    Frozen,
    /// Waiting out the scoring period; claimable once it ends.
    ScoringPending,
    /// Scores committed. Terminal.
    Scored,
    /// Fatally faulted (window overrun, corrupt payload). Terminal.
    Unscoreable,
}

impl RequestState {
    /// Whether the lifecycle table allows moving to `next`.
    pub fn can_transition(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Created, Dispatched)
            | (Dispatched, Collecting)
            | (Collecting, Frozen)
            | (Frozen, ScoringPending)
            | (ScoringPending, Scored) => true,
            // Any live state may be declared unscoreable.
            (Created | Dispatched | Collecting | Frozen | ScoringPending, Unscoreable) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Scored | RequestState::Unscoreable)
    }

    /// Whether miner submissions may still be recorded.
    pub fn accepts_submissions(self) -> bool {
        matches!(self, RequestState::Dispatched | RequestState::Collecting)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Created => "created",
            RequestState::Dispatched => "dispatched",
            RequestState::Collecting => "collecting",
            RequestState::Frozen => "frozen",
            RequestState::ScoringPending => "scoring_pending",
            RequestState::Scored => "scored",
            RequestState::Unscoreable => "unscoreable",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestState::*;

    #[test]
    fn happy_path_walks_forward() {
        let path = [Created, Dispatched, Collecting, Frozen, ScoringPending, Scored];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn backwards_and_skipping_moves_are_rejected() {
        assert!(!Dispatched.can_transition(Created));
        assert!(!Created.can_transition(Collecting));
        assert!(!Frozen.can_transition(Scored));
        assert!(!Collecting.can_transition(ScoringPending));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [Created, Dispatched, Collecting, Frozen, ScoringPending, Scored, Unscoreable] {
            assert!(!Scored.can_transition(state));
            assert!(!Unscoreable.can_transition(state));
        }
    }

    #[test]
    fn any_live_state_can_become_unscoreable() {
        for state in [Created, Dispatched, Collecting, Frozen, ScoringPending] {
            assert!(state.can_transition(Unscoreable));
            assert!(!state.is_terminal());
        }
        assert!(Scored.is_terminal());
        assert!(Unscoreable.is_terminal());
    }

    #[test]
    fn submission_window_matches_states() {
        assert!(Dispatched.accepts_submissions());
        assert!(Collecting.accepts_submissions());
        assert!(!Frozen.accepts_submissions());
        assert!(!Created.accepts_submissions());
    }
}
