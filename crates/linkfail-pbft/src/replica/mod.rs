//! PBFT replica state machine.
//!
//! The replica is a pure, deterministic state machine: it consumes an
//! event and returns its successor state together with everything it
//! wants done (messages, replies, timer commands). It never touches a
//! clock, a socket or a random source, which is what lets the simulator
//! replay a run exactly.
//!
//! # Normal Operation
//!
//! ```text
//! Client ──Request──► Primary
//!                       │
//!                       ├──PrePrepare──► Backups
//!                       │                  │
//!        All ◄──Prepare──────────────────┤   (2f+1 matching → Prepared)
//!        All ◄──Commit───────────────────┘   (2f+1 matching → Committed)
//!                       │
//! Client ◄──Reply── every replica, in sequence order
//! ```
//!
//! # View Change
//!
//! ```text
//! Backup ──ViewChange(v+1)──► All          (request timer expired)
//!   f+1 ViewChange seen ──► join the smallest higher view
//!   2f+1 ViewChange at primary(v+1) ──NewView──► All
//! ```
//!
//! # Key Types
//!
//! - [`ReplicaState`]: the state machine
//! - [`ReplicaEvent`]: inputs
//! - [`ReplicaOutput`]: outputs of one transition

mod checkpoint;
mod log;
mod normal;
mod state;
mod view_change;

pub use log::{Slot, SlotLog, SlotPhase};
pub use state::{ExecutedRequest, ReplicaState, ReplicaStatus, ServiceState};

use linkfail_types::{Digest, ReplicaId, RequestId, SeqNumber, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessagePayload, Reply, Request};

// ============================================================================
// Replica Output
// ============================================================================

/// Output produced by one state transition.
///
/// The caller is responsible for:
/// 1. Delivering `messages` (broadcasts go to every other replica)
/// 2. Delivering `replies` to the client
/// 3. Applying `timers` to its timer service
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    /// Messages to other replicas.
    pub messages: Vec<Message>,

    /// Replies to the client.
    pub replies: Vec<Reply>,

    /// Timer set/cancel commands.
    pub timers: Vec<TimerCommand>,

    /// Sequences newly committed and executed at this replica, in order.
    pub committed: Vec<CommittedEntry>,

    /// Set when the replica installed a new view during this transition.
    pub view_installed: Option<ViewNumber>,

    /// Set when the replica started a view change during this transition.
    pub view_change_started: Option<ViewNumber>,

    /// Set when the replica jumped its execution point through state transfer.
    pub state_transferred: Option<SeqNumber>,
}

impl ReplicaOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates output with only messages.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Returns true if the transition produced nothing.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.replies.is_empty()
            && self.timers.is_empty()
            && self.committed.is_empty()
            && self.view_installed.is_none()
            && self.view_change_started.is_none()
            && self.state_transferred.is_none()
    }

    /// Merges another output into this one, preserving order.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.messages.extend(other.messages);
        self.replies.extend(other.replies);
        self.timers.extend(other.timers);
        self.committed.extend(other.committed);
        if other.view_installed.is_some() {
            self.view_installed = other.view_installed;
        }
        if other.view_change_started.is_some() {
            self.view_change_started = other.view_change_started;
        }
        if other.state_transferred.is_some() {
            self.state_transferred = other.state_transferred;
        }
    }
}

/// A sequence committed and executed by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub seq: SeqNumber,
    /// View in which the commit certificate formed.
    pub view: ViewNumber,
    pub digest: Digest,
    pub request_id: RequestId,
    /// Replicas whose PREPARE (or PRE-PREPARE) formed the prepare certificate.
    pub prepare_certificate: Vec<ReplicaId>,
    /// Replicas whose COMMIT formed the commit certificate.
    pub commit_certificate: Vec<ReplicaId>,
}

// ============================================================================
// Replica Event
// ============================================================================

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A message from another replica.
    Message(Box<Message>),

    /// A request delivered directly from the client.
    ClientRequest(Request),

    /// A timer fired.
    Timeout(Timeout),
}

/// Timer kinds a replica can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// A known request has not executed in time; suspect the primary.
    Request,

    /// A view change has not completed in time.
    ViewChange,

    /// A state transfer response has not arrived.
    StateTransfer,
}

impl TimeoutKind {
    pub fn name(self) -> &'static str {
        match self {
            TimeoutKind::Request => "request",
            TimeoutKind::ViewChange => "view_change",
            TimeoutKind::StateTransfer => "state_transfer",
        }
    }
}

/// A fired timer, stamped with the view it was armed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    pub kind: TimeoutKind,
    pub view: ViewNumber,
}

/// Timer requests emitted by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerCommand {
    /// Arm (or re-arm, replacing any armed timer of the same kind).
    Set {
        kind: TimeoutKind,
        view: ViewNumber,
        after_ns: u64,
    },
    /// Disarm the timer of this kind, if any.
    Cancel { kind: TimeoutKind },
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Creates a message from this replica to a specific target.
pub(crate) fn msg_to(from: ReplicaId, to: ReplicaId, payload: MessagePayload) -> Message {
    Message::targeted(from, to, payload)
}

/// Creates a broadcast message from this replica.
pub(crate) fn msg_broadcast(from: ReplicaId, payload: MessagePayload) -> Message {
    Message::broadcast(from, payload)
}
