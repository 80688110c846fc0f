//! Replica state structure.
//!
//! [`ReplicaState`] owns everything a single PBFT replica knows: its view,
//! the slot arena, the executed service state and the bookkeeping for
//! checkpoints and view changes. The state is cloneable and contains no
//! I/O, so the simulator can drive it deterministically.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use linkfail_types::{Digest, ReplicaId, RequestId, SeqNumber, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::config::ReplicaConfig;
use crate::instrumentation::{ViolationCounters, ViolationKind};
use crate::message::{
    CheckpointProof, Message, MessageKind, MessagePayload, PrePrepare, Reply, Request,
};

use super::log::{Slot, SlotLog};
use super::{ReplicaEvent, ReplicaOutput, Timeout, TimeoutKind, TimerCommand};

// ============================================================================
// Message Deduplication
// ============================================================================

/// Identity of a normal-case or checkpoint message for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MessageId {
    pub sender: ReplicaId,
    pub kind: MessageKind,
    pub view: ViewNumber,
    pub seq: SeqNumber,
}

impl MessageId {
    pub fn pre_prepare(sender: ReplicaId, view: ViewNumber, seq: SeqNumber) -> Self {
        Self {
            sender,
            kind: MessageKind::PrePrepare,
            view,
            seq,
        }
    }

    pub fn prepare(sender: ReplicaId, view: ViewNumber, seq: SeqNumber) -> Self {
        Self {
            sender,
            kind: MessageKind::Prepare,
            view,
            seq,
        }
    }

    pub fn commit(sender: ReplicaId, view: ViewNumber, seq: SeqNumber) -> Self {
        Self {
            sender,
            kind: MessageKind::Commit,
            view,
            seq,
        }
    }

    /// Checkpoints are not view-scoped.
    pub fn checkpoint(sender: ReplicaId, seq: SeqNumber) -> Self {
        Self {
            sender,
            kind: MessageKind::Checkpoint,
            view: ViewNumber::ZERO,
            seq,
        }
    }
}

/// Tracks seen messages so a second copy of the same phase message from the
/// same sender is rejected.
///
/// Entries at or below the stable checkpoint are pruned when it advances.
#[derive(Debug, Clone, Default)]
pub(crate) struct MessageDedupTracker {
    seen: HashSet<MessageId>,
}

impl MessageDedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(())` if the message is new, `Err(())` if it is a duplicate.
    ///
    /// New messages are recorded.
    pub fn check_and_record(&mut self, msg_id: MessageId) -> Result<(), ()> {
        if !self.seen.insert(msg_id) {
            return Err(());
        }
        Ok(())
    }

    pub fn prune_through(&mut self, seq: SeqNumber) {
        self.seen.retain(|id| id.seq > seq);
    }

    pub fn tracked_count(&self) -> usize {
        self.seen.len()
    }
}

// ============================================================================
// Service State
// ============================================================================

/// Result of executing a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedRequest {
    pub seq: SeqNumber,
    /// State digest right after execution.
    pub result: Digest,
}

/// The replicated service: a digest chain over every executed request.
///
/// Also caches the result of each executed request so a retransmitted
/// request can be answered without re-executing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    state_digest: Digest,
    last_executed: SeqNumber,
    executed: BTreeMap<RequestId, ExecutedRequest>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_digest(&self) -> Digest {
        self.state_digest
    }

    pub fn last_executed(&self) -> SeqNumber {
        self.last_executed
    }

    pub fn executed(&self, request_id: RequestId) -> Option<ExecutedRequest> {
        self.executed.get(&request_id).copied()
    }

    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }

    /// Digest a checkpoint at `last_executed` advertises.
    pub fn checkpoint_digest(&self) -> Digest {
        self.state_digest
            .chain(&self.last_executed.as_u64().to_le_bytes())
    }

    /// Applies the request decided at `seq`.
    ///
    /// Null requests and requests executed before only advance the
    /// execution point. Returns the execution result for fresh requests.
    pub(crate) fn execute(&mut self, seq: SeqNumber, request: &Request) -> Option<ExecutedRequest> {
        debug_assert_eq!(seq, self.last_executed.next(), "execution must be gap-free");
        self.last_executed = seq;

        if request.is_null() || self.executed.contains_key(&request.request_id) {
            return None;
        }

        let mut material = Vec::with_capacity(8 + 32);
        material.extend_from_slice(&seq.as_u64().to_le_bytes());
        material.extend_from_slice(request.digest().as_bytes());
        self.state_digest = self.state_digest.chain(&material);

        let executed = ExecutedRequest {
            seq,
            result: self.state_digest,
        };
        self.executed.insert(request.request_id, executed);
        Some(executed)
    }
}

// ============================================================================
// Replica State
// ============================================================================

/// Protocol status of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// Running the three-phase protocol in `view`.
    Normal,
    /// Waiting for NEW-VIEW; `view` is the target view.
    ViewChange,
}

/// A state snapshot being fetched from other replicas.
#[derive(Debug, Clone)]
pub(crate) struct StateTransfer {
    pub proof: CheckpointProof,
    pub attempts: u32,
}

/// A snapshot offered in answer to a catch-up request that no checkpoint
/// proves yet. It is installed once `f + 1` replicas offer the same one.
#[derive(Debug, Clone)]
pub(crate) struct CatchUpOffer {
    pub responders: BTreeSet<ReplicaId>,
    pub snapshot: ServiceState,
}

/// The complete state of one PBFT replica.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    pub(crate) replica_id: ReplicaId,
    pub(crate) config: ReplicaConfig,
    pub(crate) authenticator: Authenticator,

    pub(crate) view: ViewNumber,
    pub(crate) status: ReplicaStatus,

    pub(crate) log: SlotLog,
    pub(crate) service: ServiceState,

    /// Highest sequence this replica assigned while primary of `view`.
    pub(crate) next_seq: SeqNumber,
    /// Known requests that have not executed yet.
    pub(crate) pending: BTreeMap<RequestId, Request>,
    /// Requests holding a PRE-PREPARE in the current view.
    pub(crate) assigned: BTreeMap<RequestId, SeqNumber>,
    pub(crate) request_timer_armed: bool,
    /// PRE-PREPAREs for views this replica has not installed yet.
    pub(crate) deferred: BTreeMap<(ViewNumber, SeqNumber), (ReplicaId, PrePrepare)>,

    pub(crate) stable_checkpoint: CheckpointProof,
    pub(crate) checkpoint_votes: BTreeMap<(SeqNumber, Digest), BTreeSet<ReplicaId>>,
    /// Snapshots at this replica's own checkpoints, for state transfer.
    pub(crate) snapshots: BTreeMap<SeqNumber, ServiceState>,
    pub(crate) state_transfer: Option<StateTransfer>,
    pub(crate) catch_up_offers: BTreeMap<(SeqNumber, Digest), CatchUpOffer>,

    /// Sealed VIEW-CHANGE envelopes by target view and sender.
    pub(crate) view_changes: BTreeMap<ViewNumber, BTreeMap<ReplicaId, Message>>,
    /// Sealed NEW-VIEW this replica sent for the current view.
    pub(crate) last_new_view: Option<Message>,
    /// Consecutive view changes without an installed view.
    pub(crate) view_change_attempts: u32,
    /// Timer expiries spent waiting on the current target view.
    pub(crate) view_change_retries: u32,

    pub(crate) dedup: MessageDedupTracker,
    pub(crate) violations: ViolationCounters,
}

impl ReplicaState {
    /// Creates a replica at view 0 in `Normal` status.
    pub fn new(replica_id: ReplicaId, config: ReplicaConfig, authenticator: Authenticator) -> Self {
        debug_assert!(
            config.cluster.contains(replica_id),
            "replica must be in cluster config"
        );

        Self {
            replica_id,
            config,
            authenticator,
            view: ViewNumber::ZERO,
            status: ReplicaStatus::Normal,
            log: SlotLog::new(config.watermark_window),
            service: ServiceState::new(),
            next_seq: SeqNumber::ZERO,
            pending: BTreeMap::new(),
            assigned: BTreeMap::new(),
            request_timer_armed: false,
            deferred: BTreeMap::new(),
            stable_checkpoint: CheckpointProof::genesis(),
            checkpoint_votes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            state_transfer: None,
            catch_up_offers: BTreeMap::new(),
            view_changes: BTreeMap::new(),
            last_new_view: None,
            view_change_attempts: 0,
            view_change_retries: 0,
            dedup: MessageDedupTracker::new(),
            violations: ViolationCounters::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Current view, or the target view while a view change is in progress.
    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    pub fn primary(&self) -> ReplicaId {
        self.config.cluster.primary(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.replica_id
    }

    pub fn last_executed(&self) -> SeqNumber {
        self.service.last_executed()
    }

    pub fn low_watermark(&self) -> SeqNumber {
        self.log.low()
    }

    pub fn high_watermark(&self) -> SeqNumber {
        self.log.high()
    }

    pub fn stable_checkpoint(&self) -> &CheckpointProof {
        &self.stable_checkpoint
    }

    pub fn service(&self) -> &ServiceState {
        &self.service
    }

    pub fn slot(&self, seq: SeqNumber) -> Option<&Slot> {
        self.log.get(seq)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn violations(&self) -> &ViolationCounters {
        &self.violations
    }

    pub fn tracked_messages(&self) -> usize {
        self.dedup.tracked_count()
    }

    // ========================================================================
    // Event Processing
    // ========================================================================

    /// Processes an event and returns the new state and output.
    ///
    /// Takes ownership of `self`; the caller keeps the returned state.
    pub fn process(self, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        match event {
            ReplicaEvent::Message(msg) => self.on_message(*msg),
            ReplicaEvent::ClientRequest(request) => self.on_client_request(request),
            ReplicaEvent::Timeout(timeout) => self.on_timeout(timeout),
        }
    }

    fn on_message(mut self, msg: Message) -> (Self, ReplicaOutput) {
        if !self.config.cluster.contains(msg.from) || msg.from == self.replica_id {
            self.record_violation(ViolationKind::UnknownSender, msg.from, msg.payload.name());
            return (self, ReplicaOutput::empty());
        }

        if let Some(to) = msg.to {
            if to != self.replica_id {
                return (self, ReplicaOutput::empty());
            }
        }

        if !self.authenticator.verify(&msg) {
            self.record_violation(ViolationKind::BadAuthenticator, msg.from, msg.payload.name());
            return (self, ReplicaOutput::empty());
        }

        tracing::trace!(
            replica = %self.replica_id,
            from = %msg.from,
            payload = msg.payload.name(),
            "received message"
        );

        let Message { from, to, auth, payload } = msg;
        match payload {
            MessagePayload::Request(request) => self.on_forwarded_request(from, request),
            MessagePayload::PrePrepare(pp) => self.on_pre_prepare(from, pp),
            MessagePayload::Prepare(prepare) => self.on_prepare(from, prepare),
            MessagePayload::Commit(commit) => self.on_commit(from, commit),
            MessagePayload::Checkpoint(checkpoint) => self.on_checkpoint(from, checkpoint),
            MessagePayload::StateRequest(request) => self.on_state_request(from, request),
            MessagePayload::StateResponse(response) => self.on_state_response(from, response),
            MessagePayload::ViewChange(vc) => {
                let envelope = Message {
                    from,
                    to,
                    payload: MessagePayload::ViewChange(vc.clone()),
                    auth,
                };
                self.on_view_change(envelope, vc)
            }
            MessagePayload::NewView(nv) => self.on_new_view(from, nv),
        }
    }

    fn on_timeout(self, timeout: Timeout) -> (Self, ReplicaOutput) {
        match timeout.kind {
            TimeoutKind::Request => self.on_request_timeout(timeout.view),
            TimeoutKind::ViewChange => self.on_view_change_timeout(timeout.view),
            TimeoutKind::StateTransfer => self.on_state_transfer_timeout(),
        }
    }

    // ========================================================================
    // Shared Helpers
    // ========================================================================

    /// Stamps an outgoing message with this replica's authenticator.
    pub(crate) fn seal(&self, message: Message) -> Message {
        debug_assert_eq!(message.from, self.replica_id);
        self.authenticator.seal(message)
    }

    pub(crate) fn record_violation(&mut self, kind: ViolationKind, from: ReplicaId, what: &str) {
        self.violations.record(kind);
        tracing::debug!(
            replica = %self.replica_id,
            from = %from,
            view = %self.view,
            message = what,
            violation = kind.name(),
            "discarded message"
        );
    }

    pub(crate) fn reply_for(&self, request_id: RequestId, executed: ExecutedRequest) -> Reply {
        Reply {
            view: self.view,
            request_id,
            seq: executed.seq,
            replica: self.replica_id,
            result: executed.result,
        }
    }

    /// Arms, re-arms or cancels the request timer.
    ///
    /// Every replica in normal status keeps it armed while any known request
    /// is unexecuted: on a backup it guards the primary, on the primary it
    /// guards progress of its own proposals. `progress` restarts an armed
    /// timer.
    pub(crate) fn refresh_request_timer(&mut self, progress: bool, output: &mut ReplicaOutput) {
        let wanted = self.status == ReplicaStatus::Normal && !self.pending.is_empty();

        if !wanted {
            if self.request_timer_armed {
                self.request_timer_armed = false;
                output.timers.push(TimerCommand::Cancel {
                    kind: TimeoutKind::Request,
                });
            }
            return;
        }

        if !self.request_timer_armed || progress {
            self.request_timer_armed = true;
            output.timers.push(TimerCommand::Set {
                kind: TimeoutKind::Request,
                view: self.view,
                after_ns: self.config.view_change_timeout_ns,
            });
        }
    }
}
