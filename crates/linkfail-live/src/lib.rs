//! # linkfail-live: validation against a real cluster
//!
//! Text-line channels over TCP and a harness that coordinates externally
//! launched nodes and a client through them. This is the only part of
//! linkfail with real threads and a wall clock; it shares nothing with the
//! simulation core except the [`ShutdownSignal`](linkfail_sim::ShutdownSignal)
//! type.
//!
//! ```ignore
//! use linkfail_live::{HarnessConfig, LiveHarness};
//!
//! let harness = LiveHarness::bind(HarnessConfig::default())?;
//! for round in 1..=3 {
//!     let report = harness.run_round(round)?;
//!     println!("round {round}: {}/{}", report.replies, report.requests_planned);
//! }
//! ```

mod channel;
mod error;
mod harness;

pub use channel::{DONE, LineChannel};
pub use error::{LiveError, Result};
pub use harness::{HarnessConfig, LiveHarness, PeerLine, RoundReport, request_line};
