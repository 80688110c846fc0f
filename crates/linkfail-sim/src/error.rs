//! Error types for the simulation engine.

use linkfail_config::ConfigError;
use thiserror::Error;

/// Errors that stop a simulation run.
///
/// Protocol violations never show up here; replicas count and discard
/// them. Liveness stalls are an outcome, not an error.
#[derive(Error, Debug)]
pub enum SimError {
    /// The configuration was rejected before the loop started.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A correctness invariant failed while running in strict mode.
    #[error("invariant '{invariant}' violated at {time_ns}ns: {message}")]
    InvariantViolation {
        invariant: String,
        message: String,
        time_ns: u64,
    },

    /// A recorded schedule could not be followed.
    #[error("replay failed: {0}")]
    Replay(#[from] ReplayError),

    /// IO error while writing logs.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while answering link decisions from a recorded schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// The run asked about a different send than the one recorded next.
    #[error("schedule diverged at link decision {position}: expected {expected}, got {actual}")]
    Divergence {
        position: usize,
        expected: String,
        actual: String,
    },

    /// The run attempted more sends than the schedule holds.
    #[error("recorded schedule exhausted after {decisions} link decisions")]
    Exhausted { decisions: usize },
}
