//! PBFT protocol messages.
//!
//! Every replica-to-replica message is a [`Message`] envelope carrying a
//! [`MessagePayload`]. Client traffic uses [`Request`] and [`Reply`]
//! directly; the simulator routes those between the driver and replicas.

use std::collections::BTreeSet;

use bytes::Bytes;
use linkfail_types::{Digest, ReplicaId, RequestId, SeqNumber, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::auth::AuthToken;
use crate::replica::ServiceState;

// ============================================================================
// Envelope
// ============================================================================

/// A message between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sending replica.
    pub from: ReplicaId,
    /// Target replica, or `None` for a broadcast to every other replica.
    pub to: Option<ReplicaId>,
    pub payload: MessagePayload,
    /// Opaque authenticator over `(from, to, payload)`.
    pub auth: Option<AuthToken>,
}

impl Message {
    pub fn targeted(from: ReplicaId, to: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
            auth: None,
        }
    }

    pub fn broadcast(from: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: None,
            payload,
            auth: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Returns a copy addressed to a single replica.
    pub fn retarget(&self, to: ReplicaId) -> Self {
        Self {
            to: Some(to),
            ..self.clone()
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Protocol message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// A client request relayed by a backup to the primary.
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
    StateRequest(StateRequest),
    StateResponse(StateResponse),
}

impl MessagePayload {
    /// View the message belongs to, if it is view-scoped.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            MessagePayload::PrePrepare(m) => Some(m.view),
            MessagePayload::Prepare(m) => Some(m.view),
            MessagePayload::Commit(m) => Some(m.view),
            MessagePayload::ViewChange(m) => Some(m.new_view),
            MessagePayload::NewView(m) => Some(m.view),
            MessagePayload::Request(_)
            | MessagePayload::Checkpoint(_)
            | MessagePayload::StateRequest(_)
            | MessagePayload::StateResponse(_) => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Request(_) => MessageKind::Request,
            MessagePayload::PrePrepare(_) => MessageKind::PrePrepare,
            MessagePayload::Prepare(_) => MessageKind::Prepare,
            MessagePayload::Commit(_) => MessageKind::Commit,
            MessagePayload::Checkpoint(_) => MessageKind::Checkpoint,
            MessagePayload::ViewChange(_) => MessageKind::ViewChange,
            MessagePayload::NewView(_) => MessageKind::NewView,
            MessagePayload::StateRequest(_) => MessageKind::StateRequest,
            MessagePayload::StateResponse(_) => MessageKind::StateResponse,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// Discriminant of a message, used for per-type link policies and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    PrePrepare,
    Prepare,
    Commit,
    Checkpoint,
    ViewChange,
    NewView,
    StateRequest,
    StateResponse,
    Reply,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Request,
        MessageKind::PrePrepare,
        MessageKind::Prepare,
        MessageKind::Commit,
        MessageKind::Checkpoint,
        MessageKind::ViewChange,
        MessageKind::NewView,
        MessageKind::StateRequest,
        MessageKind::StateResponse,
        MessageKind::Reply,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Request => "REQUEST",
            MessageKind::PrePrepare => "PRE-PREPARE",
            MessageKind::Prepare => "PREPARE",
            MessageKind::Commit => "COMMIT",
            MessageKind::Checkpoint => "CHECKPOINT",
            MessageKind::ViewChange => "VIEW-CHANGE",
            MessageKind::NewView => "NEW-VIEW",
            MessageKind::StateRequest => "STATE-REQUEST",
            MessageKind::StateResponse => "STATE-RESPONSE",
            MessageKind::Reply => "REPLY",
        }
    }

    /// Parses the snake_case configuration spelling (`pre_prepare`).
    pub fn from_config_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|kind| {
            let spelled = kind.name().to_ascii_lowercase().replace('-', "_");
            spelled == normalized
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Client Traffic
// ============================================================================

/// A client operation to be ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub operation: Bytes,
}

impl Request {
    pub fn new(request_id: RequestId, operation: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            operation: operation.into(),
        }
    }

    /// The no-op used to fill sequence gaps in a new view.
    pub fn null() -> Self {
        Self {
            request_id: RequestId::NULL,
            operation: Bytes::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.request_id.is_null()
    }

    /// Digest binding the request id and operation bytes.
    pub fn digest(&self) -> Digest {
        let mut buf = Vec::with_capacity(8 + self.operation.len());
        buf.extend_from_slice(&self.request_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.operation);
        Digest::of(&buf)
    }
}

/// A replica's answer to the client after executing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub view: ViewNumber,
    pub request_id: RequestId,
    pub seq: SeqNumber,
    pub replica: ReplicaId,
    /// Service state digest right after executing the request.
    pub result: Digest,
}

// ============================================================================
// Normal Case
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: Digest,
    pub request: Request,
}

impl PrePrepare {
    pub fn new(view: ViewNumber, seq: SeqNumber, request: Request) -> Self {
        Self {
            view,
            seq,
            digest: request.digest(),
            request,
        }
    }

    /// True if the advertised digest matches the carried request.
    pub fn is_consistent(&self) -> bool {
        self.digest == self.request.digest()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: Digest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: Digest,
}

// ============================================================================
// Checkpoints
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: SeqNumber,
    pub state_digest: Digest,
}

/// Evidence that a checkpoint was reached by enough replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointProof {
    pub seq: SeqNumber,
    pub state_digest: Digest,
    pub voters: Vec<ReplicaId>,
}

impl CheckpointProof {
    /// The checkpoint every replica starts from.
    pub fn genesis() -> Self {
        Self {
            seq: SeqNumber::ZERO,
            state_digest: Digest::ZERO,
            voters: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.seq == SeqNumber::ZERO
    }

    /// Genesis, or at least `threshold` distinct voters.
    pub fn is_valid(&self, threshold: usize) -> bool {
        if self.is_genesis() {
            return self.state_digest == Digest::ZERO;
        }
        distinct_count(&self.voters) >= threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    pub seq: SeqNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    pub seq: SeqNumber,
    pub snapshot: ServiceState,
}

// ============================================================================
// View Change
// ============================================================================

/// A prepare certificate carried as view-change evidence.
///
/// `voters` are replica ids, not the sealed PREPARE envelopes behind them:
/// a receiver checks their number, membership and that the primary of
/// `view` is among them, but it cannot confirm each voter really sent a
/// PREPARE. The VIEW-CHANGE envelope carrying the proof is authenticated,
/// so a forged certificate is always attributable to its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: Digest,
    pub request: Request,
    pub voters: Vec<ReplicaId>,
}

impl PreparedProof {
    /// Distinct voters reaching `quorum`, the primary of `view` among them,
    /// and a digest matching the request.
    pub fn is_valid(&self, quorum: usize, primary: ReplicaId) -> bool {
        self.digest == self.request.digest()
            && self.voters.contains(&primary)
            && distinct_count(&self.voters) >= quorum
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub new_view: ViewNumber,
    /// Latest checkpoint the sender can prove.
    pub checkpoint: CheckpointProof,
    /// Highest-view prepare certificate for every slot above the checkpoint.
    pub prepared: Vec<PreparedProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: ViewNumber,
    /// The `2f + 1` authenticated VIEW-CHANGE envelopes the primary used.
    pub view_changes: Vec<Message>,
    /// Re-proposals for every slot between the chosen checkpoint and the
    /// highest prepared sequence.
    pub pre_prepares: Vec<PrePrepare>,
}

fn distinct_count(voters: &[ReplicaId]) -> usize {
    voters.iter().collect::<BTreeSet<_>>().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_digest_binds_id_and_operation() {
        let a = Request::new(RequestId::new(1), b"op".to_vec());
        let b = Request::new(RequestId::new(2), b"op".to_vec());
        let c = Request::new(RequestId::new(1), b"other".to_vec());
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }

    #[test]
    fn pre_prepare_consistency() {
        let request = Request::new(RequestId::new(1), b"op".to_vec());
        let mut pp = PrePrepare::new(ViewNumber::ZERO, SeqNumber::new(1), request);
        assert!(pp.is_consistent());
        pp.digest = pp.digest.corrupted();
        assert!(!pp.is_consistent());
    }

    #[test]
    fn prepared_proof_needs_distinct_voters() {
        let request = Request::new(RequestId::new(3), b"x".to_vec());
        let proof = PreparedProof {
            view: ViewNumber::ZERO,
            seq: SeqNumber::new(1),
            digest: request.digest(),
            request,
            voters: vec![ReplicaId::new(0), ReplicaId::new(0), ReplicaId::new(1)],
        };
        assert!(!proof.is_valid(3, ReplicaId::new(0)));
        assert!(proof.is_valid(2, ReplicaId::new(0)));
    }

    #[test]
    fn prepared_proof_must_name_the_primary_of_its_view() {
        let request = Request::new(RequestId::new(4), b"y".to_vec());
        let proof = PreparedProof {
            view: ViewNumber::new(1),
            seq: SeqNumber::new(1),
            digest: request.digest(),
            request,
            voters: vec![ReplicaId::new(0), ReplicaId::new(2), ReplicaId::new(3)],
        };
        assert!(!proof.is_valid(3, ReplicaId::new(1)));
        assert!(proof.is_valid(3, ReplicaId::new(0)));
    }

    #[test]
    fn genesis_checkpoint_is_always_valid() {
        assert!(CheckpointProof::genesis().is_valid(3));
        let forged = CheckpointProof {
            seq: SeqNumber::ZERO,
            state_digest: Digest::of(b"x"),
            voters: Vec::new(),
        };
        assert!(!forged.is_valid(3));
    }

    #[test]
    fn message_kind_parses_config_names() {
        assert_eq!(
            MessageKind::from_config_name("pre_prepare"),
            Some(MessageKind::PrePrepare)
        );
        assert_eq!(
            MessageKind::from_config_name("VIEW-CHANGE"),
            Some(MessageKind::ViewChange)
        );
        assert_eq!(MessageKind::from_config_name("gossip"), None);
    }

    #[test]
    fn payload_view_is_exposed_for_view_scoped_messages() {
        let prepare = MessagePayload::Prepare(Prepare {
            view: ViewNumber::new(4),
            seq: SeqNumber::new(1),
            digest: Digest::ZERO,
        });
        assert_eq!(prepare.view(), Some(ViewNumber::new(4)));
        let checkpoint = MessagePayload::Checkpoint(Checkpoint {
            seq: SeqNumber::new(16),
            state_digest: Digest::ZERO,
        });
        assert_eq!(checkpoint.view(), None);
        assert_eq!(checkpoint.name(), "CHECKPOINT");
    }
}
