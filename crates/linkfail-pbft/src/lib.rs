//! # linkfail-pbft: PBFT replica state machine
//!
//! A pure, deterministic implementation of Practical Byzantine Fault
//! Tolerance for an `N = 3f + 1` cluster:
//!
//! - three-phase agreement (PRE-PREPARE, PREPARE, COMMIT) over a sliding
//!   watermark window
//! - checkpoints with state transfer for replicas that fall behind
//! - view change with NEW-VIEW recomputation by the backups
//! - an abstract keyed-MAC authenticator instead of signatures
//!
//! Replicas do no I/O. Each transition takes an event and returns the next
//! state plus the messages, replies and timer commands it produced; the
//! simulator in `linkfail-sim` owns delivery and time.
//!
//! ```ignore
//! let config = ReplicaConfig::new(ClusterConfig::new(4)?);
//! let replica = ReplicaState::new(ReplicaId::new(0), config, Authenticator::from_seed(42));
//! let (replica, output) = replica.process(ReplicaEvent::ClientRequest(request));
//! ```

mod auth;
mod byzantine;
mod config;
mod instrumentation;
mod message;
mod replica;


pub use auth::{AUTH_TOKEN_LENGTH, AuthToken, Authenticator};
pub use byzantine::{ByzantineBehavior, Outbound, ParseBehaviorError};
pub use config::{ClusterConfig, ClusterError, ReplicaConfig};
pub use instrumentation::{ViolationCounters, ViolationKind};
pub use message::{
    Checkpoint, CheckpointProof, Commit, Message, MessageKind, MessagePayload, NewView,
    PrePrepare, Prepare, PreparedProof, Reply, Request, StateRequest, StateResponse, ViewChange,
};
pub use replica::{
    CommittedEntry, ExecutedRequest, ReplicaEvent, ReplicaOutput, ReplicaState, ReplicaStatus,
    ServiceState, Slot, SlotLog, SlotPhase, Timeout, TimeoutKind, TimerCommand,
};

pub use linkfail_types::{Digest, ReplicaId, RequestId, SeqNumber, ViewNumber};
