//! Normal-case protocol handlers.
//!
//! - REQUEST (client or forwarded by a backup)
//! - PRE-PREPARE (primary → backups)
//! - PREPARE (backups → all)
//! - COMMIT (all → all)
//! - in-order execution and REPLY

use linkfail_types::{Digest, ReplicaId, SeqNumber, ViewNumber};

use crate::instrumentation::ViolationKind;
use crate::message::{Commit, MessagePayload, PrePrepare, Prepare, PreparedProof, Request};

use super::log::{CommittedSlot, Slot, SlotPhase};
use super::state::{MessageId, ReplicaStatus};
use super::{CommittedEntry, ReplicaOutput, ReplicaState, msg_broadcast, msg_to};

impl ReplicaState {
    // ========================================================================
    // Requests
    // ========================================================================

    /// Handles a request delivered by the client.
    pub(crate) fn on_client_request(mut self, request: Request) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        self.admit_request(request, true, &mut output);
        (self, output)
    }

    /// Handles a request relayed by a backup.
    pub(crate) fn on_forwarded_request(
        mut self,
        from: ReplicaId,
        request: Request,
    ) -> (Self, ReplicaOutput) {
        tracing::trace!(
            replica = %self.replica_id,
            from = %from,
            request = %request.request_id,
            "forwarded request"
        );
        let mut output = ReplicaOutput::empty();
        self.admit_request(request, false, &mut output);
        (self, output)
    }

    /// Records a request and either proposes it (primary) or relays it to the
    /// primary and starts suspecting it (backup). Both arm the request timer.
    fn admit_request(&mut self, request: Request, forward: bool, output: &mut ReplicaOutput) {
        if request.is_null() {
            return;
        }

        if let Some(executed) = self.service.executed(request.request_id) {
            output.replies.push(self.reply_for(request.request_id, executed));
            return;
        }

        self.pending
            .entry(request.request_id)
            .or_insert_with(|| request.clone());

        if self.status != ReplicaStatus::Normal {
            return;
        }

        if self.is_primary() {
            self.propose_pending(output);
            self.refresh_request_timer(false, output);
            return;
        }

        if forward {
            let primary = self.primary();
            output.messages.push(self.seal(msg_to(
                self.replica_id,
                primary,
                MessagePayload::Request(request),
            )));
        }
        self.refresh_request_timer(false, output);
    }

    /// Assigns sequence numbers to pending requests that hold no slot in the
    /// current view, as far as the high watermark allows.
    pub(crate) fn propose_pending(&mut self, output: &mut ReplicaOutput) {
        if self.status != ReplicaStatus::Normal || !self.is_primary() {
            return;
        }

        let unassigned: Vec<Request> = self
            .pending
            .values()
            .filter(|r| !self.assigned.contains_key(&r.request_id))
            .cloned()
            .collect();

        for request in unassigned {
            let seq = self
                .next_seq
                .max(self.log.low())
                .max(self.service.last_executed())
                .next();
            if !self.log.in_window(seq) {
                tracing::debug!(
                    replica = %self.replica_id,
                    seq = %seq,
                    high = %self.log.high(),
                    queued = self.pending.len(),
                    "window full, queueing requests"
                );
                break;
            }
            self.next_seq = seq;

            let pre_prepare = PrePrepare::new(self.view, seq, request);
            tracing::trace!(
                replica = %self.replica_id,
                view = %self.view,
                seq = %seq,
                request = %pre_prepare.request.request_id,
                "proposing"
            );
            output.messages.push(self.seal(msg_broadcast(
                self.replica_id,
                MessagePayload::PrePrepare(pre_prepare.clone()),
            )));
            self.accept_pre_prepare(self.replica_id, pre_prepare, output);
        }
    }

    // ========================================================================
    // Pre-Prepare
    // ========================================================================

    pub(crate) fn on_pre_prepare(
        mut self,
        from: ReplicaId,
        pre_prepare: PrePrepare,
    ) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        self.handle_pre_prepare(from, pre_prepare, &mut output);
        (self, output)
    }

    pub(crate) fn handle_pre_prepare(
        &mut self,
        from: ReplicaId,
        pre_prepare: PrePrepare,
        output: &mut ReplicaOutput,
    ) {
        if pre_prepare.view < self.view {
            self.record_violation(ViolationKind::StaleView, from, "PRE-PREPARE");
            return;
        }

        if pre_prepare.view > self.view || self.status != ReplicaStatus::Normal {
            self.defer_pre_prepare(from, pre_prepare);
            return;
        }

        if from != self.primary() {
            self.record_violation(ViolationKind::WrongPrimary, from, "PRE-PREPARE");
            return;
        }

        if !pre_prepare.is_consistent() {
            self.record_violation(ViolationKind::DigestMismatch, from, "PRE-PREPARE");
            return;
        }

        if pre_prepare.seq <= self.log.low() {
            tracing::trace!(replica = %self.replica_id, seq = %pre_prepare.seq, "pre-prepare for released slot");
            return;
        }
        if !self.log.in_window(pre_prepare.seq) {
            self.record_violation(ViolationKind::OutOfWindow, from, "PRE-PREPARE");
            return;
        }

        let held = self
            .log
            .get(pre_prepare.seq)
            .and_then(Slot::pre_prepare)
            .is_some_and(|held| held.view == pre_prepare.view && held.digest == pre_prepare.digest);
        if held {
            self.echo_votes(pre_prepare.seq, output);
            return;
        }

        let msg_id = MessageId::pre_prepare(from, pre_prepare.view, pre_prepare.seq);
        if self.dedup.check_and_record(msg_id).is_err() {
            self.record_violation(ViolationKind::Duplicate, from, "PRE-PREPARE");
            return;
        }

        if self.accept_pre_prepare(from, pre_prepare, output) {
            self.refresh_request_timer(false, output);
        }
    }

    /// Answers a retransmitted PRE-PREPARE by rebroadcasting this backup's
    /// PREPARE for the slot, and its COMMIT once prepared in this view.
    fn echo_votes(&mut self, seq: SeqNumber, output: &mut ReplicaOutput) {
        let view = self.view;
        let Some(slot) = self.log.get(seq) else {
            return;
        };
        let Some(digest) = slot.pre_prepare().map(|pp| pp.digest) else {
            return;
        };
        let prepared = slot.prepared_proof().is_some_and(|proof| proof.view == view);

        tracing::trace!(replica = %self.replica_id, view = %view, seq = %seq, prepared, "echoing votes");
        output.messages.push(self.seal(msg_broadcast(
            self.replica_id,
            MessagePayload::Prepare(Prepare { view, seq, digest }),
        )));
        if prepared {
            output.messages.push(self.seal(msg_broadcast(
                self.replica_id,
                MessagePayload::Commit(Commit { view, seq, digest }),
            )));
        }
    }

    /// Rebroadcasts the PRE-PREPARE of every slot this primary proposed in
    /// the current view that has not executed yet, with its own COMMIT for
    /// slots it already prepared.
    pub(crate) fn retransmit_open_slots(&mut self, output: &mut ReplicaOutput) {
        let view = self.view;
        let executed = self.service.last_executed();

        let mut payloads = Vec::new();
        for slot in self.log.iter().filter(|slot| slot.seq() > executed) {
            let Some(pp) = slot.pre_prepare().filter(|pp| pp.view == view) else {
                continue;
            };
            payloads.push(MessagePayload::PrePrepare(pp.clone()));
            if slot.prepared_proof().is_some_and(|proof| proof.view == view) {
                payloads.push(MessagePayload::Commit(Commit {
                    view,
                    seq: pp.seq,
                    digest: pp.digest,
                }));
            }
        }

        tracing::debug!(
            replica = %self.replica_id,
            view = %view,
            messages = payloads.len(),
            "retransmitting open slots"
        );
        for payload in payloads {
            output
                .messages
                .push(self.seal(msg_broadcast(self.replica_id, payload)));
        }
    }

    /// Holds a PRE-PREPARE for a view not installed yet.
    fn defer_pre_prepare(&mut self, from: ReplicaId, pre_prepare: PrePrepare) {
        let capacity = usize::try_from(self.config.watermark_window).unwrap_or(usize::MAX);
        if self.deferred.len() >= capacity {
            tracing::debug!(
                replica = %self.replica_id,
                view = %pre_prepare.view,
                seq = %pre_prepare.seq,
                "deferred pre-prepare buffer full"
            );
            return;
        }
        self.deferred
            .insert((pre_prepare.view, pre_prepare.seq), (from, pre_prepare));
    }

    /// Binds `pre_prepare` to its slot for the current view and, on a backup,
    /// broadcasts the matching PREPARE.
    ///
    /// Returns false if the slot already holds a PRE-PREPARE in this view.
    pub(crate) fn accept_pre_prepare(
        &mut self,
        primary: ReplicaId,
        pre_prepare: PrePrepare,
        output: &mut ReplicaOutput,
    ) -> bool {
        let view = pre_prepare.view;
        let seq = pre_prepare.seq;
        let digest = pre_prepare.digest;
        let request = pre_prepare.request.clone();

        let Some(slot) = self.log.get_mut(seq) else {
            return false;
        };

        if let Some(existing) = slot.pre_prepare().filter(|existing| existing.view == view) {
            let kind = if existing.digest == digest {
                ViolationKind::Duplicate
            } else {
                ViolationKind::DigestMismatch
            };
            self.record_violation(kind, primary, "PRE-PREPARE");
            return false;
        }

        slot.accept_pre_prepare(pre_prepare, primary);
        let backup = primary != self.replica_id;
        if backup {
            slot.add_prepare(view, digest, self.replica_id);
        }

        if !request.is_null() {
            self.assigned.insert(request.request_id, seq);
            if self.service.executed(request.request_id).is_none() {
                self.pending.entry(request.request_id).or_insert(request);
            }
        }

        if backup {
            output.messages.push(self.seal(msg_broadcast(
                self.replica_id,
                MessagePayload::Prepare(Prepare { view, seq, digest }),
            )));
        }

        self.check_prepared(seq, output);
        true
    }

    // ========================================================================
    // Prepare
    // ========================================================================

    pub(crate) fn on_prepare(mut self, from: ReplicaId, prepare: Prepare) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        if !self.admit_vote(from, "PREPARE", prepare.view, prepare.seq, prepare.digest) {
            return (self, output);
        }
        let counted = self
            .log
            .get(prepare.seq)
            .and_then(|slot| slot.prepare_voters(prepare.view, prepare.digest))
            .is_some_and(|voters| voters.contains(&from));
        if counted {
            tracing::trace!(replica = %self.replica_id, from = %from, seq = %prepare.seq, "retransmitted prepare");
            return (self, output);
        }
        let msg_id = MessageId::prepare(from, prepare.view, prepare.seq);
        if self.dedup.check_and_record(msg_id).is_err() {
            self.record_violation(ViolationKind::Duplicate, from, "PREPARE");
            return (self, output);
        }

        if let Some(slot) = self.log.get_mut(prepare.seq) {
            slot.add_prepare(prepare.view, prepare.digest, from);
        }

        if prepare.view == self.view && self.status == ReplicaStatus::Normal {
            self.check_prepared(prepare.seq, &mut output);
        }
        (self, output)
    }

    // ========================================================================
    // Commit
    // ========================================================================

    pub(crate) fn on_commit(mut self, from: ReplicaId, commit: Commit) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        if !self.admit_vote(from, "COMMIT", commit.view, commit.seq, commit.digest) {
            return (self, output);
        }
        let counted = self
            .log
            .get(commit.seq)
            .and_then(|slot| slot.commit_voters(commit.view, commit.digest))
            .is_some_and(|voters| voters.contains(&from));
        if counted {
            tracing::trace!(replica = %self.replica_id, from = %from, seq = %commit.seq, "retransmitted commit");
            return (self, output);
        }
        let msg_id = MessageId::commit(from, commit.view, commit.seq);
        if self.dedup.check_and_record(msg_id).is_err() {
            self.record_violation(ViolationKind::Duplicate, from, "COMMIT");
            return (self, output);
        }

        if let Some(slot) = self.log.get_mut(commit.seq) {
            slot.add_commit(commit.view, commit.digest, from);
        }

        if commit.view == self.view && self.status == ReplicaStatus::Normal {
            self.check_committed(commit.seq, &mut output);
        }
        (self, output)
    }

    /// Shared validation for PREPARE and COMMIT votes.
    ///
    /// Votes for a future view are kept so they count once that view is
    /// installed. Late votes for slots already released by a stable
    /// checkpoint are dropped quietly.
    fn admit_vote(
        &mut self,
        from: ReplicaId,
        what: &str,
        view: ViewNumber,
        seq: SeqNumber,
        digest: Digest,
    ) -> bool {
        if view < self.view {
            self.record_violation(ViolationKind::StaleView, from, what);
            return false;
        }

        if seq <= self.log.low() {
            tracing::trace!(replica = %self.replica_id, from = %from, seq = %seq, "{what} for released slot");
            return false;
        }
        if !self.log.in_window(seq) {
            self.record_violation(ViolationKind::OutOfWindow, from, what);
            return false;
        }

        let conflicting = self
            .log
            .get(seq)
            .and_then(|slot| slot.pre_prepare())
            .is_some_and(|pp| pp.view == view && pp.digest != digest);
        if conflicting {
            self.record_violation(ViolationKind::DigestMismatch, from, what);
            return false;
        }
        true
    }

    // ========================================================================
    // Certificates
    // ========================================================================

    /// Moves a slot to `Prepared` once it holds `2f + 1` matching prepare
    /// votes for its PRE-PREPARE, and broadcasts COMMIT.
    pub(crate) fn check_prepared(&mut self, seq: SeqNumber, output: &mut ReplicaOutput) {
        let quorum = self.config.cluster.quorum();
        let view = self.view;

        let Some(slot) = self.log.get_mut(seq) else {
            return;
        };
        if slot.phase() != SlotPhase::PrePrepared {
            return;
        }
        let Some(pp) = slot.pre_prepare().filter(|pp| pp.view == view) else {
            return;
        };
        let digest = pp.digest;
        let request = pp.request.clone();

        let voters: Vec<ReplicaId> = slot
            .prepare_voters(view, digest)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if voters.len() < quorum {
            return;
        }

        slot.mark_prepared(PreparedProof {
            view,
            seq,
            digest,
            request,
            voters,
        });
        slot.add_commit(view, digest, self.replica_id);

        tracing::trace!(replica = %self.replica_id, view = %view, seq = %seq, "prepared");
        output.messages.push(self.seal(msg_broadcast(
            self.replica_id,
            MessagePayload::Commit(Commit { view, seq, digest }),
        )));

        self.check_committed(seq, output);
    }

    /// Decides a prepared slot once `2f + 1` matching commits are present,
    /// then executes everything that became contiguous.
    pub(crate) fn check_committed(&mut self, seq: SeqNumber, output: &mut ReplicaOutput) {
        let quorum = self.config.cluster.quorum();
        let view = self.view;

        let Some(slot) = self.log.get_mut(seq) else {
            return;
        };
        if slot.phase() != SlotPhase::Prepared {
            return;
        }
        let Some(pp) = slot.pre_prepare().filter(|pp| pp.view == view) else {
            return;
        };
        let digest = pp.digest;
        let request = pp.request.clone();

        let commit_certificate: Vec<ReplicaId> = slot
            .commit_voters(view, digest)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if commit_certificate.len() < quorum {
            return;
        }

        slot.mark_committed_phase();
        if slot.committed.is_none() {
            let prepare_certificate = slot
                .prepared_proof()
                .map(|proof| proof.voters.clone())
                .unwrap_or_default();
            slot.committed = Some(CommittedSlot {
                entry: CommittedEntry {
                    seq,
                    view,
                    digest,
                    request_id: request.request_id,
                    prepare_certificate,
                    commit_certificate,
                },
                request,
            });
            tracing::trace!(replica = %self.replica_id, view = %view, seq = %seq, "committed");
        }

        self.execute_committed(output);
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes decided slots in sequence order, replying to the client for
    /// every fresh request.
    pub(crate) fn execute_committed(&mut self, output: &mut ReplicaOutput) {
        let mut progressed = false;

        loop {
            let seq = self.service.last_executed().next();
            let Some(slot) = self.log.get_mut(seq) else {
                break;
            };
            let Some(committed) = slot.committed.as_ref() else {
                break;
            };
            let entry = committed.entry.clone();
            let request = committed.request.clone();
            slot.executed = true;

            let executed = self.service.execute(seq, &request);
            self.pending.remove(&request.request_id);
            if let Some(executed) = executed {
                output.replies.push(self.reply_for(request.request_id, executed));
            }

            tracing::debug!(
                replica = %self.replica_id,
                view = %entry.view,
                seq = %seq,
                request = %entry.request_id,
                "executed"
            );
            output.committed.push(entry);
            progressed = true;

            self.maybe_checkpoint(output);
        }

        if progressed {
            self.settle_state_transfer(output);
            self.refresh_request_timer(true, output);
        }
    }
}
