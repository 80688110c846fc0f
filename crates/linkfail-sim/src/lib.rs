//! # linkfail-sim: PBFT under Bernoulli link failures
//!
//! A discrete-event simulation of an `N = 3f + 1` PBFT cluster in which
//! every directed link drops each message independently with a configured
//! probability. Runs are fully deterministic: the same seed and
//! configuration give the same commits, metrics and log bytes.

// Simulation statistics use f64 for rates and percentages
#![allow(clippy::cast_precision_loss)]
#![cfg_attr(test, allow(clippy::float_cmp))]
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Simulation                              │
//! │  ┌───────────┐   ┌────────────┐   ┌─────────────────────────┐  │
//! │  │ SimClock  │   │ EventQueue │   │ SimRng (per-link forks) │  │
//! │  └───────────┘   └────────────┘   └─────────────────────────┘  │
//! │                                                                │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │ ReplicaState × N   TimerService   LinkOracle   Driver    │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! │                                                                │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │ Agreement  CommitOrder  ViewMonotonic  Partition checkers │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use linkfail_config::ExperimentConfig;
//! use linkfail_sim::Simulation;
//!
//! let mut config = ExperimentConfig::default();
//! config.network.drop_probability = 0.1;
//!
//! let report = Simulation::new(&config)?.run()?;
//! assert!(report.outcome.is_converged());
//! ```
//!
//! ## Key Concepts
//!
//! - **`LinkModel`**: Bernoulli drop and uniform delay per directed link
//! - **`TimerService`**: replica timers in simulated time, lazily cancelled
//! - **`ClientDriver`**: request window, reply quorums, latency
//! - **`EventLog`** / **`ScheduleReplayer`**: record and replay link decisions
//! - **`ExperimentRunner`** / **`Sweep`**: seed batches and parameter grids

mod clock;
mod driver;
mod error;
mod event;
mod event_log;
mod invariant;
mod metrics;
mod network;
mod replay;
mod result_log;
mod rng;
mod runner;
mod shutdown;
mod simulation;
mod timer;

pub use clock::{SimClock, ms_to_ns, ns_to_ms, ns_to_ms_f64};
pub use driver::{ClientAction, ClientDriver, CompletedRequest, SafetyViolation};
pub use error::{ReplayError, SimError};
pub use event::{Event, EventId, EventKind, EventQueue};
pub use event_log::{Decision, EVENT_LOG_VERSION, EventLog, EventLogSummary, LinkStep, LoggedEvent};
pub use invariant::{
    AgreementChecker, CommitOrderChecker, InvariantChecker, InvariantResult, PartitionChecker,
    ViewMonotonicChecker, ViolationRecord,
};
pub use metrics::{LatencyStats, MetricsCollector, Outcome, RunReport};
pub use network::{
    Endpoint, LinkCounters, LinkDecision, LinkModel, LinkOracle, LinkPolicy, LinkStats,
};
pub use replay::ScheduleReplayer;
pub use result_log::{ResultLog, result_file_name};
pub use rng::SimRng;
pub use runner::{BatchResults, ExperimentRunner, Sweep, SweepRow};
pub use shutdown::ShutdownSignal;
pub use simulation::Simulation;
pub use timer::{TimerHandle, TimerService};
