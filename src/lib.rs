//! Ranking and aggregation engine for national exam results.
//!
//! Recomputes per-subject grades and ranks, best-subject divisions, averages
//! and geographic rankings for an exam, then writes them back in retried,
//! chunked transactions.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod persist;
pub mod store;
pub mod thresholds;

pub use config::EngineConfig;
pub use error::{ConfigurationError, EngineError, StoreError};
pub use orchestrator::{Orchestrator, RunSummary};
