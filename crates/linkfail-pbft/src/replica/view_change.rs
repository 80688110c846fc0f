//! View change protocol handlers.
//!
//! 1. **VIEW-CHANGE**: a backup whose request timer expires moves to view
//!    `v + 1` and broadcasts its stable checkpoint and prepared certificates
//! 2. **Join**: `f + 1` VIEW-CHANGE messages for higher views pull a
//!    replica into the smallest of them
//! 3. **NEW-VIEW**: the primary of the target view collects `2f + 1`
//!    VIEW-CHANGE messages and re-proposes every slot between the latest
//!    proven checkpoint and the highest prepared sequence
//!
//! # Safety Properties
//!
//! - A request prepared by `2f + 1` replicas in an earlier view is
//!   re-proposed with the same digest: any `2f + 1` VIEW-CHANGE set
//!   intersects its prepare certificate in a correct replica
//! - Backups recompute the re-proposals and reject a NEW-VIEW that differs

use std::collections::{BTreeMap, BTreeSet};

use linkfail_types::{ReplicaId, SeqNumber, ViewNumber};

use crate::instrumentation::ViolationKind;
use crate::message::{
    CheckpointProof, Message, MessagePayload, NewView, PrePrepare, PreparedProof, Request,
    ViewChange,
};

use super::state::ReplicaStatus;
use super::{ReplicaOutput, ReplicaState, TimeoutKind, TimerCommand, msg_broadcast};

/// What a NEW-VIEW installs: the checkpoint to start from and the
/// re-proposals above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NewViewPlan {
    pub checkpoint: CheckpointProof,
    pub pre_prepares: Vec<PrePrepare>,
}

/// Derives the NEW-VIEW contents from a set of VIEW-CHANGE messages.
///
/// `min_s` is the highest checkpoint any of them proves; every sequence in
/// `(min_s, max_s]` is re-proposed with the highest-view prepared request
/// for it, or a null request if none was prepared.
pub(crate) fn compute_new_view(view: ViewNumber, view_changes: &[ViewChange]) -> NewViewPlan {
    let checkpoint = view_changes
        .iter()
        .map(|vc| &vc.checkpoint)
        .fold(None::<&CheckpointProof>, |best, c| match best {
            Some(b) if b.seq >= c.seq => Some(b),
            _ => Some(c),
        })
        .cloned()
        .unwrap_or_else(CheckpointProof::genesis);
    let min_s = checkpoint.seq;

    let mut chosen: BTreeMap<SeqNumber, &PreparedProof> = BTreeMap::new();
    for proof in view_changes.iter().flat_map(|vc| vc.prepared.iter()) {
        if proof.seq <= min_s {
            continue;
        }
        let replace = chosen.get(&proof.seq).is_none_or(|current| {
            proof.view > current.view || (proof.view == current.view && proof.digest < current.digest)
        });
        if replace {
            chosen.insert(proof.seq, proof);
        }
    }
    let max_s = chosen.keys().next_back().copied().unwrap_or(min_s);

    let pre_prepares = min_s
        .range_exclusive_inclusive(max_s)
        .map(|seq| {
            let request = chosen
                .get(&seq)
                .map_or_else(Request::null, |proof| proof.request.clone());
            PrePrepare::new(view, seq, request)
        })
        .collect();

    NewViewPlan {
        checkpoint,
        pre_prepares,
    }
}

impl ReplicaState {
    // ========================================================================
    // View Change Initiation
    // ========================================================================

    /// Handles the request timer: a known request did not execute in time.
    ///
    /// Every replica asks its peers for state it may have missed. The
    /// primary then retransmits its open slots and keeps waiting; a backup
    /// suspects the primary and starts a view change.
    pub(crate) fn on_request_timeout(mut self, view: ViewNumber) -> (Self, ReplicaOutput) {
        if self.status != ReplicaStatus::Normal || view != self.view {
            return (self, ReplicaOutput::empty());
        }
        self.request_timer_armed = false;
        if self.pending.is_empty() {
            return (self, ReplicaOutput::empty());
        }

        let mut output = ReplicaOutput::empty();
        self.request_catch_up(&mut output);

        if self.is_primary() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                pending = self.pending.len(),
                executed = %self.service.last_executed(),
                "no progress on own proposals, retransmitting"
            );
            self.retransmit_open_slots(&mut output);
            self.refresh_request_timer(false, &mut output);
            return (self, output);
        }

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            pending = self.pending.len(),
            "request timer expired, suspecting primary"
        );
        let target = self.view.next();
        self.start_view_change(target, &mut output);
        (self, output)
    }

    /// Moves to `ViewChange` status for `target` and broadcasts VIEW-CHANGE.
    pub(crate) fn start_view_change(&mut self, target: ViewNumber, output: &mut ReplicaOutput) {
        debug_assert!(target >= self.view);

        self.view = target;
        self.status = ReplicaStatus::ViewChange;
        self.view_change_retries = 0;
        self.assigned.clear();
        self.last_new_view = None;
        if self.request_timer_armed {
            self.request_timer_armed = false;
            output.timers.push(TimerCommand::Cancel {
                kind: TimeoutKind::Request,
            });
        }

        let view_change = self.build_view_change(target);
        tracing::info!(
            replica = %self.replica_id,
            view = %target,
            checkpoint = %view_change.checkpoint.seq,
            prepared = view_change.prepared.len(),
            attempt = self.view_change_attempts,
            "starting view change"
        );
        let msg = self.seal(msg_broadcast(
            self.replica_id,
            MessagePayload::ViewChange(view_change),
        ));
        self.view_changes
            .entry(target)
            .or_default()
            .insert(self.replica_id, msg.clone());
        output.messages.push(msg);

        output.timers.push(TimerCommand::Set {
            kind: TimeoutKind::ViewChange,
            view: target,
            after_ns: self.config.backoff_timeout_ns(self.view_change_attempts),
        });
        self.view_change_attempts = self.view_change_attempts.saturating_add(1);
        output.view_change_started = Some(target);

        self.try_assemble_new_view(output);
    }

    /// Proofs stay within one window of the stable checkpoint, the range
    /// receivers accept. A catch-up install can move the log past it.
    fn build_view_change(&self, target: ViewNumber) -> ViewChange {
        let checkpoint = self.stable_checkpoint.clone();
        let ceiling = checkpoint.seq.plus(self.config.watermark_window);
        let prepared = self
            .log
            .iter()
            .filter_map(|slot| slot.prepared_proof())
            .filter(|proof| proof.seq > checkpoint.seq && proof.seq <= ceiling)
            .cloned()
            .collect();
        ViewChange {
            new_view: target,
            checkpoint,
            prepared,
        }
    }

    /// Checks the evidence a VIEW-CHANGE carries.
    pub(crate) fn validate_view_change(&self, vc: &ViewChange) -> bool {
        let quorum = self.config.cluster.quorum();
        if !vc.checkpoint.is_valid(quorum) {
            return false;
        }
        if vc.checkpoint.voters.iter().any(|v| !self.config.cluster.contains(*v)) {
            return false;
        }
        let ceiling = vc.checkpoint.seq.plus(self.config.watermark_window);
        let mut seqs = BTreeSet::new();
        vc.prepared.iter().all(|proof| {
            proof.is_valid(quorum, self.config.cluster.primary(proof.view))
                && proof.seq > vc.checkpoint.seq
                && proof.seq <= ceiling
                && proof.view < vc.new_view
                && proof.voters.iter().all(|v| self.config.cluster.contains(*v))
                && seqs.insert(proof.seq)
        })
    }

    // ========================================================================
    // VIEW-CHANGE Handler
    // ========================================================================

    pub(crate) fn on_view_change(mut self, envelope: Message, vc: ViewChange) -> (Self, ReplicaOutput) {
        let from = envelope.from;
        let mut output = ReplicaOutput::empty();

        if !self.validate_view_change(&vc) {
            self.record_violation(ViolationKind::InvalidCertificate, from, "VIEW-CHANGE");
            return (self, output);
        }

        if vc.new_view < self.view {
            self.record_violation(ViolationKind::StaleView, from, "VIEW-CHANGE");
            return (self, output);
        }

        if vc.new_view == self.view && self.status == ReplicaStatus::Normal {
            // The sender missed the NEW-VIEW for the view we are already in.
            if let Some(new_view) = &self.last_new_view {
                tracing::debug!(
                    replica = %self.replica_id,
                    to = %from,
                    view = %self.view,
                    "resending new view"
                );
                let resend = self.seal(new_view.retarget(from));
                output.messages.push(resend);
            }
            return (self, output);
        }

        self.view_changes
            .entry(vc.new_view)
            .or_default()
            .insert(from, envelope);

        if let Some(join) = self.view_to_join() {
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                join = %join,
                "joining view change"
            );
            self.start_view_change(join, &mut output);
        } else if self.status == ReplicaStatus::ViewChange && vc.new_view == self.view {
            self.try_assemble_new_view(&mut output);
        }

        (self, output)
    }

    /// Smallest view above our own that `f + 1` other replicas already moved
    /// towards, if any.
    fn view_to_join(&self) -> Option<ViewNumber> {
        let mut senders = BTreeSet::new();
        let mut smallest = None;
        for (view, votes) in self.view_changes.range(self.view.next()..) {
            for sender in votes.keys().filter(|s| **s != self.replica_id) {
                senders.insert(*sender);
                smallest.get_or_insert(*view);
            }
        }
        (senders.len() >= self.config.cluster.weak_quorum())
            .then_some(smallest)
            .flatten()
    }

    /// On the primary of the target view: once `2f + 1` VIEW-CHANGE messages
    /// are in, broadcast NEW-VIEW and install the view.
    fn try_assemble_new_view(&mut self, output: &mut ReplicaOutput) {
        if self.status != ReplicaStatus::ViewChange || !self.is_primary() {
            return;
        }
        let quorum = self.config.cluster.quorum();
        let Some(votes) = self.view_changes.get(&self.view) else {
            return;
        };
        if votes.len() < quorum {
            return;
        }

        // Our own VIEW-CHANGE first so its prepared certificates are covered.
        let mut envelopes: Vec<Message> = Vec::with_capacity(quorum);
        envelopes.extend(votes.get(&self.replica_id).cloned());
        envelopes.extend(
            votes
                .iter()
                .filter(|(sender, _)| **sender != self.replica_id)
                .map(|(_, envelope)| envelope.clone()),
        );
        envelopes.truncate(quorum);

        let view_changes: Vec<ViewChange> = envelopes
            .iter()
            .filter_map(|envelope| match &envelope.payload {
                MessagePayload::ViewChange(vc) => Some(vc.clone()),
                _ => None,
            })
            .collect();
        let plan = compute_new_view(self.view, &view_changes);

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            checkpoint = %plan.checkpoint.seq,
            reproposed = plan.pre_prepares.len(),
            "sending new view"
        );
        let msg = self.seal(msg_broadcast(
            self.replica_id,
            MessagePayload::NewView(NewView {
                view: self.view,
                view_changes: envelopes,
                pre_prepares: plan.pre_prepares.clone(),
            }),
        ));
        self.last_new_view = Some(msg.clone());
        output.messages.push(msg);

        let view = self.view;
        self.install_view(view, plan, output);
    }

    // ========================================================================
    // NEW-VIEW Handler
    // ========================================================================

    pub(crate) fn on_new_view(mut self, from: ReplicaId, nv: NewView) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        if nv.view < self.view {
            self.record_violation(ViolationKind::StaleView, from, "NEW-VIEW");
            return (self, output);
        }
        if nv.view == self.view && self.status == ReplicaStatus::Normal {
            return (self, output);
        }
        if from != self.config.cluster.primary(nv.view) {
            self.record_violation(ViolationKind::WrongPrimary, from, "NEW-VIEW");
            return (self, output);
        }

        let Some(view_changes) = self.validate_new_view(&nv) else {
            self.record_violation(ViolationKind::InvalidNewView, from, "NEW-VIEW");
            return (self, output);
        };
        let plan = compute_new_view(nv.view, &view_changes);
        if plan.pre_prepares != nv.pre_prepares {
            self.record_violation(ViolationKind::InvalidNewView, from, "NEW-VIEW");
            return (self, output);
        }

        self.install_view(nv.view, plan, &mut output);
        (self, output)
    }

    /// Authenticates the carried VIEW-CHANGE envelopes and returns their
    /// payloads in order.
    fn validate_new_view(&self, nv: &NewView) -> Option<Vec<ViewChange>> {
        let mut senders = BTreeSet::new();
        let mut view_changes = Vec::with_capacity(nv.view_changes.len());

        for envelope in &nv.view_changes {
            if !self.config.cluster.contains(envelope.from) || !self.authenticator.verify(envelope) {
                return None;
            }
            let MessagePayload::ViewChange(vc) = &envelope.payload else {
                return None;
            };
            if vc.new_view != nv.view || !self.validate_view_change(vc) {
                return None;
            }
            if !senders.insert(envelope.from) {
                return None;
            }
            view_changes.push(vc.clone());
        }

        (senders.len() >= self.config.cluster.quorum()).then_some(view_changes)
    }

    // ========================================================================
    // View Installation
    // ========================================================================

    /// Enters `Normal` status in `view` with the re-proposals of `plan`.
    fn install_view(&mut self, view: ViewNumber, plan: NewViewPlan, output: &mut ReplicaOutput) {
        let primary = self.config.cluster.primary(view);

        self.view = view;
        self.status = ReplicaStatus::Normal;
        self.view_change_attempts = 0;
        self.view_change_retries = 0;
        self.view_changes.retain(|v, _| *v > view);
        self.assigned.clear();
        if primary != self.replica_id {
            self.last_new_view = None;
        }
        output.timers.push(TimerCommand::Cancel {
            kind: TimeoutKind::ViewChange,
        });
        output.view_installed = Some(view);

        tracing::info!(
            replica = %self.replica_id,
            view = %view,
            primary = %primary,
            "installed view"
        );

        if plan.checkpoint.seq > self.stable_checkpoint.seq {
            if plan.checkpoint.seq <= self.service.last_executed() {
                self.make_stable(plan.checkpoint.clone(), output);
            } else {
                self.begin_state_transfer(plan.checkpoint.clone(), output);
            }
        }

        for slot in self.log.iter_mut() {
            slot.reset_for_view(view);
        }

        self.next_seq = plan
            .pre_prepares
            .last()
            .map_or(plan.checkpoint.seq, |pp| pp.seq)
            .max(plan.checkpoint.seq);
        for pre_prepare in plan.pre_prepares {
            if self.log.in_window(pre_prepare.seq) {
                self.accept_pre_prepare(primary, pre_prepare, output);
            }
        }

        let deferred = std::mem::take(&mut self.deferred);
        let (ready, later): (BTreeMap<_, _>, BTreeMap<_, _>) = deferred
            .into_iter()
            .filter(|((v, _), _)| *v >= view)
            .partition(|((v, _), _)| *v == view);
        self.deferred = later;
        for (_, (from, pre_prepare)) in ready {
            self.handle_pre_prepare(from, pre_prepare, output);
        }

        self.propose_pending(output);
        self.refresh_request_timer(true, output);
    }

    // ========================================================================
    // View Change Timeout
    // ========================================================================

    /// The target view did not start in time.
    ///
    /// With a full VIEW-CHANGE quorum already seen, the target primary is
    /// presumed faulty and the replica moves on to the next view. Otherwise
    /// its own VIEW-CHANGE is retransmitted.
    pub(crate) fn on_view_change_timeout(mut self, view: ViewNumber) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        if self.status != ReplicaStatus::ViewChange || view != self.view {
            return (self, output);
        }

        let collected = self.view_changes.get(&self.view).map_or(0, BTreeMap::len);
        if collected >= self.config.cluster.quorum() && self.view_change_retries >= 1 {
            let target = self.view.next();
            tracing::info!(
                replica = %self.replica_id,
                view = %self.view,
                next = %target,
                "new view did not arrive, escalating"
            );
            self.start_view_change(target, &mut output);
            return (self, output);
        }

        self.view_change_retries = self.view_change_retries.saturating_add(1);
        if let Some(own) = self
            .view_changes
            .get(&self.view)
            .and_then(|votes| votes.get(&self.replica_id))
        {
            output.messages.push(own.clone());
        }
        // Peers still in the old view keep executing; a replica left alone
        // in this view change follows their state until it can rejoin.
        self.request_catch_up(&mut output);
        tracing::debug!(
            replica = %self.replica_id,
            view = %self.view,
            collected,
            retry = self.view_change_retries,
            "retransmitting view change"
        );
        output.timers.push(TimerCommand::Set {
            kind: TimeoutKind::ViewChange,
            view: self.view,
            after_ns: self.config.backoff_timeout_ns(self.view_change_attempts),
        });
        (self, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ReplicaEvent, Timeout};
    use crate::tests::{cluster, deliver, request, sealed};
    use linkfail_types::{Digest, RequestId};

    fn proof(view: u64, seq: u64, request_id: u64) -> PreparedProof {
        let request = request(request_id);
        PreparedProof {
            view: ViewNumber::new(view),
            seq: SeqNumber::new(seq),
            digest: request.digest(),
            request,
            voters: vec![ReplicaId::new(0), ReplicaId::new(1), ReplicaId::new(2)],
        }
    }

    fn view_change(view: u64, prepared: Vec<PreparedProof>) -> ViewChange {
        ViewChange {
            new_view: ViewNumber::new(view),
            checkpoint: CheckpointProof::genesis(),
            prepared,
        }
    }

    fn request_timeout(view: u64) -> ReplicaEvent {
        ReplicaEvent::Timeout(Timeout {
            kind: TimeoutKind::Request,
            view: ViewNumber::new(view),
        })
    }

    #[test]
    fn new_view_keeps_highest_prepared_and_fills_gaps() {
        let vcs = vec![
            view_change(2, vec![proof(0, 1, 10), proof(0, 3, 30)]),
            view_change(2, vec![proof(1, 1, 11)]),
            view_change(2, vec![]),
        ];
        let plan = compute_new_view(ViewNumber::new(2), &vcs);

        let requests: Vec<RequestId> = plan
            .pre_prepares
            .iter()
            .map(|pp| pp.request.request_id)
            .collect();
        assert_eq!(
            requests,
            vec![RequestId::new(11), RequestId::NULL, RequestId::new(30)]
        );
        assert!(plan.pre_prepares.iter().all(|pp| pp.view == ViewNumber::new(2)));
        assert!(plan.pre_prepares.iter().all(PrePrepare::is_consistent));
    }

    #[test]
    fn new_view_starts_above_highest_checkpoint() {
        let mut with_checkpoint = view_change(1, vec![proof(0, 5, 50)]);
        with_checkpoint.checkpoint = CheckpointProof {
            seq: SeqNumber::new(4),
            state_digest: Digest::of(b"state"),
            voters: vec![ReplicaId::new(0), ReplicaId::new(1), ReplicaId::new(2)],
        };
        let vcs = vec![view_change(1, vec![proof(0, 2, 20)]), with_checkpoint];
        let plan = compute_new_view(ViewNumber::new(1), &vcs);

        assert_eq!(plan.checkpoint.seq, SeqNumber::new(4));
        assert_eq!(plan.pre_prepares.len(), 1);
        assert_eq!(plan.pre_prepares[0].seq, SeqNumber::new(5));
    }

    #[test]
    fn request_timeout_starts_view_change() {
        let replicas = cluster(4);
        let (backup, _) = replicas[1]
            .clone()
            .process(ReplicaEvent::ClientRequest(request(1)));
        let (backup, output) = backup.process(request_timeout(0));

        assert_eq!(backup.status(), ReplicaStatus::ViewChange);
        assert_eq!(backup.view(), ViewNumber::new(1));
        assert_eq!(output.view_change_started, Some(ViewNumber::new(1)));
        assert!(
            output
                .messages
                .iter()
                .any(|m| matches!(m.payload, MessagePayload::ViewChange(_)))
        );
    }

    #[test]
    fn request_timeout_asks_peers_for_state() {
        let replicas = cluster(4);
        let (backup, _) = replicas[3]
            .clone()
            .process(ReplicaEvent::ClientRequest(request(1)));
        let (_, output) = backup.process(request_timeout(0));

        let asked: Vec<_> = output
            .messages
            .iter()
            .filter_map(|m| match &m.payload {
                MessagePayload::StateRequest(req) if m.is_broadcast() => Some(req.seq),
                _ => None,
            })
            .collect();
        assert_eq!(asked, vec![SeqNumber::new(1)]);
    }

    #[test]
    fn primary_timeout_retransmits_open_slots_without_view_change() {
        let replicas = cluster(4);
        let (primary, _) = replicas[0]
            .clone()
            .process(ReplicaEvent::ClientRequest(request(1)));
        let (primary, output) = primary.process(request_timeout(0));

        assert_eq!(primary.status(), ReplicaStatus::Normal);
        assert_eq!(primary.view(), ViewNumber::ZERO);
        assert!(output.view_change_started.is_none());
        let resent: Vec<SeqNumber> = output
            .messages
            .iter()
            .filter_map(|m| match &m.payload {
                MessagePayload::PrePrepare(pp) => Some(pp.seq),
                _ => None,
            })
            .collect();
        assert_eq!(resent, vec![SeqNumber::new(1)]);
        assert!(output.timers.iter().any(|t| matches!(
            t,
            TimerCommand::Set {
                kind: TimeoutKind::Request,
                ..
            }
        )));
    }

    #[test]
    fn stale_request_timeout_is_ignored() {
        let replicas = cluster(4);
        let (backup, _) = replicas[1]
            .clone()
            .process(ReplicaEvent::ClientRequest(request(1)));
        let (backup, output) = backup.process(request_timeout(7));
        assert_eq!(backup.status(), ReplicaStatus::Normal);
        assert!(output.is_empty());
    }

    #[test]
    fn full_view_change_installs_new_view_everywhere() {
        let replicas = cluster(4);
        let mut vc_messages = Vec::new();
        let mut states = Vec::new();
        for replica in replicas {
            let id = replica.replica_id();
            let (replica, _) = replica.process(ReplicaEvent::ClientRequest(request(1)));
            if id.as_u8() == 2 || id.as_u8() == 3 {
                let (replica, out) = replica.process(request_timeout(0));
                vc_messages.extend(out.messages);
                states.push(replica);
            } else {
                states.push(replica);
            }
        }

        // Replica 1 joins on f + 1 VIEW-CHANGE messages and, as primary of
        // view 1, assembles NEW-VIEW from 2f + 1.
        let mut new_primary = states[1].clone();
        let mut new_view_msg = None;
        for msg in &vc_messages {
            let (next, out) = deliver(new_primary, msg);
            new_primary = next;
            if let Some(nv) = out
                .messages
                .iter()
                .find(|m| matches!(m.payload, MessagePayload::NewView(_)))
            {
                new_view_msg = Some(nv.clone());
            }
        }
        assert_eq!(new_primary.view(), ViewNumber::new(1));
        assert_eq!(new_primary.status(), ReplicaStatus::Normal);
        let new_view_msg = new_view_msg.expect("new primary sent NEW-VIEW");

        let (backup, out) = deliver(states[2].clone(), &new_view_msg);
        assert_eq!(backup.status(), ReplicaStatus::Normal);
        assert_eq!(backup.view(), ViewNumber::new(1));
        assert_eq!(out.view_installed, Some(ViewNumber::new(1)));
    }

    #[test]
    fn prepared_proof_without_its_primary_is_rejected() {
        let replicas = cluster(4);
        let mut forged = proof(1, 1, 10);
        forged.voters = vec![ReplicaId::new(0), ReplicaId::new(2), ReplicaId::new(3)];
        let msg = sealed(
            2,
            None,
            MessagePayload::ViewChange(view_change(2, vec![forged])),
        );

        let (replica, out) = deliver(replicas[3].clone(), &msg);
        assert!(out.messages.is_empty());
        assert_eq!(replica.violations().get(ViolationKind::InvalidCertificate), 1);
        assert!(!replica.view_changes.contains_key(&ViewNumber::new(2)));
    }

    #[test]
    fn tampered_new_view_is_rejected() {
        let replicas = cluster(4);
        let mut vc_messages = Vec::new();
        let mut new_primary = replicas[1].clone();
        for replica in [replicas[2].clone(), replicas[3].clone()] {
            let (replica, _) = replica.process(ReplicaEvent::ClientRequest(request(1)));
            let (_, out) = replica.process(request_timeout(0));
            vc_messages.extend(out.messages);
        }
        let mut new_view = None;
        for msg in &vc_messages {
            let (next, out) = deliver(new_primary, msg);
            new_primary = next;
            new_view = new_view.or_else(|| {
                out.messages
                    .into_iter()
                    .find(|m| matches!(m.payload, MessagePayload::NewView(_)))
            });
        }
        let mut forged = new_view.expect("new view");
        if let MessagePayload::NewView(nv) = &mut forged.payload {
            nv.pre_prepares
                .push(PrePrepare::new(ViewNumber::new(1), SeqNumber::new(1), request(99)));
        }
        let forged = new_primary.authenticator.seal(forged);

        let (backup, out) = deliver(replicas[3].clone(), &forged);
        assert!(out.view_installed.is_none());
        assert_eq!(backup.violations().get(ViolationKind::InvalidNewView), 1);
    }

    #[test]
    fn view_change_timeout_retransmits_then_escalates() {
        let replicas = cluster(4);
        let (backup, _) = replicas[2]
            .clone()
            .process(ReplicaEvent::ClientRequest(request(1)));
        let (mut backup, _) = backup.process(request_timeout(0));

        let fire = ReplicaEvent::Timeout(Timeout {
            kind: TimeoutKind::ViewChange,
            view: ViewNumber::new(1),
        });
        let (next, out) = backup.process(fire.clone());
        backup = next;
        assert_eq!(backup.view(), ViewNumber::new(1));
        let retransmitted: Vec<_> = out
            .messages
            .iter()
            .filter(|m| matches!(m.payload, MessagePayload::ViewChange(_)))
            .collect();
        assert_eq!(retransmitted.len(), 1, "own VIEW-CHANGE retransmitted");
        assert!(
            out.messages
                .iter()
                .any(|m| matches!(m.payload, MessagePayload::StateRequest(_)) && m.is_broadcast())
        );

        // Pretend a quorum for view 1 was seen; the silent primary never
        // answered, so the next expiry moves on.
        let own = backup.view_changes[&ViewNumber::new(1)][&backup.replica_id()].clone();
        for other in [0u8, 3] {
            backup
                .view_changes
                .entry(ViewNumber::new(1))
                .or_default()
                .insert(ReplicaId::new(other), own.clone());
        }
        let (backup, out) = backup.process(fire);
        assert_eq!(backup.view(), ViewNumber::new(2));
        assert_eq!(out.view_change_started, Some(ViewNumber::new(2)));
    }
}
