//! YieldNet service layer: the asynchronous validator runtime.
//!
//! [`yieldnet_core`] is deliberately synchronous and deterministic; this
//! crate adds the moving parts a live validator needs around it:
//!
//! - [`components`]: trait boundaries for the network edges (miner
//!   transport, chain reads, weight publication) plus in-process
//!   implementations for tests and local runs
//! - [`dispatch`]: concurrent fan-out of one request to its miner set
//!   with a shared response deadline
//! - [`pipeline`]: the deterministic scoring computation run under a
//!   claim
//! - [`sweep`]: the periodic pass that retires, promotes, claims and
//!   scores requests
//!
//! The request store is the source of truth throughout: every stage
//! reads the record, advances it and persists before moving on, so a
//! restarted validator resumes exactly where the records say it stopped.

pub mod components;
pub mod dispatch;
pub mod pipeline;
pub mod sweep;

use thiserror::Error;

use yieldnet_core::EngineError;

pub use components::{
    ChainDataSource, LoggingWeightSink, MemoryWeightSink, MinerBehavior, MinerClient,
    MockMinerClient, StaticChainData, WeightSink,
};
pub use dispatch::{dispatch_request, DispatchOutcome};
pub use sweep::{ScoringSweep, SweepReport};

/// Service-level error type; engine errors pass through unchanged.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("chain data source: {0}")]
    ChainData(String),

    #[error("weight publication: {0}")]
    WeightSink(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
