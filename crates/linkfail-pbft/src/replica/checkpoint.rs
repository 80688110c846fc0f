//! Checkpoints, watermark advancement and state transfer.
//!
//! Every `checkpoint_interval` executed sequences a replica broadcasts
//! CHECKPOINT. `2f + 1` matching votes make the checkpoint stable, which
//! moves the low watermark and releases slots. A replica that learns of a
//! checkpoint it cannot reach by executing (`f + 1` matching votes above
//! its execution point) fetches a snapshot from one of the voters.
//!
//! A replica whose execution stalls without any checkpoint to aim for
//! broadcasts a catch-up STATE-REQUEST instead. Peers that are ahead answer
//! with their state, and the first snapshot offered by `f + 1` distinct
//! replicas is installed: at least one of them is correct.

use std::collections::BTreeSet;

use linkfail_types::{Digest, ReplicaId, SeqNumber};

use crate::instrumentation::ViolationKind;
use crate::message::{Checkpoint, CheckpointProof, MessagePayload, StateRequest, StateResponse};

use super::state::{CatchUpOffer, MessageId, ServiceState, StateTransfer};
use super::{ReplicaOutput, ReplicaState, TimeoutKind, TimerCommand, msg_broadcast, msg_to};

impl ReplicaState {
    // ========================================================================
    // Checkpoint Production
    // ========================================================================

    /// Broadcasts CHECKPOINT if the execution point sits on an interval
    /// boundary.
    pub(crate) fn maybe_checkpoint(&mut self, output: &mut ReplicaOutput) {
        let seq = self.service.last_executed();
        if seq == SeqNumber::ZERO || seq.as_u64() % self.config.checkpoint_interval != 0 {
            return;
        }

        let state_digest = self.service.checkpoint_digest();
        self.snapshots.insert(seq, self.service.clone());
        self.checkpoint_votes
            .entry((seq, state_digest))
            .or_default()
            .insert(self.replica_id);

        tracing::debug!(
            replica = %self.replica_id,
            seq = %seq,
            digest = %state_digest.short(),
            "checkpoint"
        );
        output.messages.push(self.seal(msg_broadcast(
            self.replica_id,
            MessagePayload::Checkpoint(Checkpoint { seq, state_digest }),
        )));

        self.check_checkpoint(seq, state_digest, output);
    }

    // ========================================================================
    // Checkpoint Handler
    // ========================================================================

    pub(crate) fn on_checkpoint(
        mut self,
        from: ReplicaId,
        checkpoint: Checkpoint,
    ) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        if checkpoint.seq <= self.stable_checkpoint.seq {
            return (self, output);
        }

        let msg_id = MessageId::checkpoint(from, checkpoint.seq);
        if self.dedup.check_and_record(msg_id).is_err() {
            self.record_violation(ViolationKind::Duplicate, from, "CHECKPOINT");
            return (self, output);
        }

        self.checkpoint_votes
            .entry((checkpoint.seq, checkpoint.state_digest))
            .or_default()
            .insert(from);
        self.check_checkpoint(checkpoint.seq, checkpoint.state_digest, &mut output);
        (self, output)
    }

    /// Reacts to the votes collected for `(seq, digest)`.
    fn check_checkpoint(
        &mut self,
        seq: SeqNumber,
        state_digest: Digest,
        output: &mut ReplicaOutput,
    ) {
        let voters: Vec<ReplicaId> = self
            .checkpoint_votes
            .get(&(seq, state_digest))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let proof = CheckpointProof {
            seq,
            state_digest,
            voters,
        };
        let behind = seq > self.service.last_executed();

        if proof.voters.len() >= self.config.cluster.quorum() {
            if behind {
                self.begin_state_transfer(proof, output);
                return;
            }
            let own = self.snapshots.get(&seq).map(ServiceState::checkpoint_digest);
            if own.is_some_and(|own| own != state_digest) {
                tracing::warn!(
                    replica = %self.replica_id,
                    seq = %seq,
                    "stable checkpoint disagrees with local state"
                );
                return;
            }
            self.make_stable(proof, output);
        } else if behind && proof.voters.len() >= self.config.cluster.weak_quorum() {
            self.begin_state_transfer(proof, output);
        }
    }

    /// Adopts `proof` as the stable checkpoint and releases everything at or
    /// below it.
    pub(crate) fn make_stable(&mut self, proof: CheckpointProof, output: &mut ReplicaOutput) {
        if proof.seq <= self.stable_checkpoint.seq {
            return;
        }
        debug_assert!(proof.seq <= self.service.last_executed());

        let seq = proof.seq;
        self.stable_checkpoint = proof;
        self.log.advance_low(seq);
        self.checkpoint_votes.retain(|(s, _), _| *s > seq);
        self.snapshots.retain(|s, _| *s >= seq);
        self.deferred.retain(|(_, s), _| *s > seq);
        self.dedup.prune_through(seq);

        tracing::debug!(
            replica = %self.replica_id,
            seq = %seq,
            low = %self.log.low(),
            high = %self.log.high(),
            "checkpoint stable"
        );

        self.settle_state_transfer(output);
        self.propose_pending(output);
    }

    // ========================================================================
    // State Transfer
    // ========================================================================

    /// Records that the replica is behind `proof`.
    ///
    /// The request goes out immediately only when the checkpoint lies beyond
    /// the high watermark; otherwise in-flight commits get a grace period to
    /// close the gap first.
    pub(crate) fn begin_state_transfer(
        &mut self,
        proof: CheckpointProof,
        output: &mut ReplicaOutput,
    ) {
        if proof.seq <= self.service.last_executed() {
            return;
        }
        if let Some(current) = &mut self.state_transfer {
            if current.proof.seq > proof.seq {
                return;
            }
            if current.proof.seq == proof.seq {
                if proof.voters.len() > current.proof.voters.len() {
                    current.proof = proof;
                }
                return;
            }
        }

        tracing::debug!(
            replica = %self.replica_id,
            seq = %proof.seq,
            executed = %self.service.last_executed(),
            "behind proven checkpoint"
        );

        let immediate = proof.seq > self.log.high();
        self.state_transfer = Some(StateTransfer { proof, attempts: 0 });
        if immediate {
            self.send_state_request(output);
        }
        output.timers.push(TimerCommand::Set {
            kind: TimeoutKind::StateTransfer,
            view: self.view,
            after_ns: self.config.state_transfer_timeout_ns(),
        });
    }

    fn send_state_request(&mut self, output: &mut ReplicaOutput) {
        let replica_id = self.replica_id;
        let Some(transfer) = self.state_transfer.as_mut() else {
            return;
        };
        let candidates: Vec<ReplicaId> = transfer
            .proof
            .voters
            .iter()
            .copied()
            .filter(|voter| *voter != replica_id)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let index = transfer.attempts as usize % candidates.len();
        let target = candidates[index];
        let seq = transfer.proof.seq;
        transfer.attempts = transfer.attempts.saturating_add(1);

        tracing::debug!(replica = %replica_id, target = %target, seq = %seq, "requesting state");
        output.messages.push(self.seal(msg_to(
            replica_id,
            target,
            MessagePayload::StateRequest(StateRequest { seq }),
        )));
    }

    /// Asks every peer for state from the execution point onwards.
    pub(crate) fn request_catch_up(&mut self, output: &mut ReplicaOutput) {
        let seq = self.service.last_executed().next();
        self.catch_up_offers.retain(|(offered, _), _| *offered >= seq);

        tracing::debug!(replica = %self.replica_id, seq = %seq, "requesting catch-up state");
        output.messages.push(self.seal(msg_broadcast(
            self.replica_id,
            MessagePayload::StateRequest(StateRequest { seq }),
        )));
    }

    /// Drops the transfer target and stale catch-up offers once execution
    /// has caught up with them.
    pub(crate) fn settle_state_transfer(&mut self, output: &mut ReplicaOutput) {
        let executed = self.service.last_executed();
        self.catch_up_offers.retain(|(offered, _), _| *offered > executed);
        let caught_up = self
            .state_transfer
            .as_ref()
            .is_some_and(|t| t.proof.seq <= self.service.last_executed());
        if caught_up {
            self.state_transfer = None;
            output.timers.push(TimerCommand::Cancel {
                kind: TimeoutKind::StateTransfer,
            });
        }
    }

    pub(crate) fn on_state_transfer_timeout(mut self) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        if self.state_transfer.is_none() {
            return (self, output);
        }
        self.settle_state_transfer(&mut output);
        if self.state_transfer.is_none() {
            return (self, output);
        }

        self.send_state_request(&mut output);
        output.timers.push(TimerCommand::Set {
            kind: TimeoutKind::StateTransfer,
            view: self.view,
            after_ns: self.config.state_transfer_timeout_ns(),
        });
        (self, output)
    }

    /// Serves the checkpoint snapshot at `seq` if one is kept, else the
    /// newest one above it, else the live state when execution has passed
    /// `seq`.
    pub(crate) fn on_state_request(
        self,
        from: ReplicaId,
        request: StateRequest,
    ) -> (Self, ReplicaOutput) {
        let snapshot = self
            .snapshots
            .get(&request.seq)
            .or_else(|| self.snapshots.range(request.seq..).next_back().map(|(_, s)| s))
            .or_else(|| (self.service.last_executed() >= request.seq).then_some(&self.service));
        let Some(snapshot) = snapshot.cloned() else {
            tracing::debug!(
                replica = %self.replica_id,
                from = %from,
                seq = %request.seq,
                "no snapshot for state request"
            );
            return (self, ReplicaOutput::empty());
        };

        let response = StateResponse {
            seq: snapshot.last_executed(),
            snapshot,
        };
        let msg = self.seal(msg_to(
            self.replica_id,
            from,
            MessagePayload::StateResponse(response),
        ));
        (self, ReplicaOutput::with_messages(vec![msg]))
    }

    pub(crate) fn on_state_response(
        mut self,
        from: ReplicaId,
        response: StateResponse,
    ) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        let StateResponse { seq, snapshot } = response;

        if seq <= self.service.last_executed() {
            return (self, output);
        }
        if snapshot.last_executed() != seq {
            self.record_violation(ViolationKind::InvalidCertificate, from, "STATE-RESPONSE");
            return (self, output);
        }

        let digest = snapshot.checkpoint_digest();
        let weak_quorum = self.config.cluster.weak_quorum();
        let votes = self
            .checkpoint_votes
            .get(&(seq, digest))
            .map_or(0, BTreeSet::len);
        let matches_target = self
            .state_transfer
            .as_ref()
            .is_some_and(|t| t.proof.seq == seq && t.proof.state_digest == digest);

        let snapshot = if votes >= weak_quorum || matches_target {
            snapshot
        } else {
            let offer = self
                .catch_up_offers
                .entry((seq, digest))
                .or_insert_with(|| CatchUpOffer {
                    responders: BTreeSet::new(),
                    snapshot,
                });
            offer.responders.insert(from);
            let offered = offer.responders.len();
            if offered < weak_quorum {
                tracing::debug!(
                    replica = %self.replica_id,
                    from = %from,
                    seq = %seq,
                    offered,
                    "holding unconfirmed state offer"
                );
                return (self, output);
            }
            offer.snapshot.clone()
        };

        self.install_snapshot(seq, snapshot, &mut output);
        (self, output)
    }

    /// Replaces the service state with a proven snapshot and resumes
    /// execution above it. Only snapshots on a checkpoint boundary count as
    /// this replica's checkpoint vote.
    fn install_snapshot(&mut self, seq: SeqNumber, snapshot: ServiceState, output: &mut ReplicaOutput) {
        let digest = snapshot.checkpoint_digest();
        tracing::info!(
            replica = %self.replica_id,
            seq = %seq,
            from_seq = %self.service.last_executed(),
            "installed state snapshot"
        );

        self.service = snapshot;
        let service = &self.service;
        self.pending
            .retain(|id, _| service.executed(*id).is_none());
        if seq > self.log.high() {
            self.log.advance_low(seq);
        }
        self.next_seq = self.next_seq.max(seq);
        output.state_transferred = Some(seq);

        self.settle_state_transfer(output);
        if seq.as_u64() % self.config.checkpoint_interval == 0 {
            self.snapshots.insert(seq, self.service.clone());
            self.checkpoint_votes
                .entry((seq, digest))
                .or_default()
                .insert(self.replica_id);
            self.check_checkpoint(seq, digest, output);
        }
        self.execute_committed(output);
        self.refresh_request_timer(true, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, ReplicaConfig};
    use crate::replica::ReplicaEvent;
    use crate::tests::{cluster_with, deliver, request, sealed};

    fn small_config() -> ReplicaConfig {
        ReplicaConfig::new(ClusterConfig::new(4).expect("cluster"))
            .with_checkpoint_interval(2)
            .with_watermark_window(4)
    }

    fn checkpoint_msg(from: u8, seq: u64, digest: Digest) -> crate::message::Message {
        sealed(
            from,
            None,
            MessagePayload::Checkpoint(Checkpoint {
                seq: SeqNumber::new(seq),
                state_digest: digest,
            }),
        )
    }

    fn executed_through(replica: &mut ReplicaState, seq: u64) {
        for s in 1..=seq {
            replica.service.execute(SeqNumber::new(s), &request(s));
            replica.maybe_checkpoint(&mut ReplicaOutput::empty());
        }
    }

    #[test]
    fn quorum_of_checkpoints_advances_watermarks() {
        let mut replicas = cluster_with(small_config());
        let mut replica = replicas.remove(1);
        executed_through(&mut replica, 2);
        let digest = replica.service().checkpoint_digest();

        let (replica, _) = deliver(replica, &checkpoint_msg(0, 2, digest));
        assert_eq!(replica.low_watermark(), SeqNumber::ZERO);
        let (replica, _) = deliver(replica, &checkpoint_msg(2, 2, digest));

        assert_eq!(replica.low_watermark(), SeqNumber::new(2));
        assert_eq!(replica.high_watermark(), SeqNumber::new(6));
        assert_eq!(replica.stable_checkpoint().seq, SeqNumber::new(2));
        assert_eq!(replica.stable_checkpoint().voters.len(), 3);
    }

    #[test]
    fn lagging_replica_fetches_state_after_grace_period() {
        let replicas = cluster_with(small_config());
        let mut ahead = replicas[0].clone();
        executed_through(&mut ahead, 2);
        let digest = ahead.service().checkpoint_digest();

        let lagging = replicas[3].clone();
        let (lagging, out) = deliver(lagging, &checkpoint_msg(0, 2, digest));
        assert!(out.timers.is_empty());
        let (lagging, out) = deliver(lagging, &checkpoint_msg(1, 2, digest));
        assert!(out.messages.is_empty(), "waits before asking");
        assert!(matches!(
            out.timers.as_slice(),
            [TimerCommand::Set {
                kind: TimeoutKind::StateTransfer,
                ..
            }]
        ));

        let (lagging, out) = lagging.process(ReplicaEvent::Timeout(crate::replica::Timeout {
            kind: TimeoutKind::StateTransfer,
            view: linkfail_types::ViewNumber::ZERO,
        }));
        let request_msg = out
            .messages
            .iter()
            .find(|m| matches!(m.payload, MessagePayload::StateRequest(_)))
            .expect("state request sent");
        assert_eq!(request_msg.to, Some(ReplicaId::new(0)));

        let (_, served) = deliver(ahead, request_msg);
        let response = served.messages.first().expect("state response");
        let (lagging, out) = deliver(lagging, response);

        assert_eq!(out.state_transferred, Some(SeqNumber::new(2)));
        assert_eq!(lagging.last_executed(), SeqNumber::new(2));
        assert_eq!(lagging.service().checkpoint_digest(), digest);
    }

    fn offer(from: u8, to: u8, snapshot: &ServiceState) -> crate::message::Message {
        sealed(
            from,
            Some(to),
            MessagePayload::StateResponse(StateResponse {
                seq: snapshot.last_executed(),
                snapshot: snapshot.clone(),
            }),
        )
    }

    #[test]
    fn single_unproven_snapshot_is_held() {
        let replicas = cluster_with(small_config());
        let mut forged = ServiceState::new();
        forged.execute(SeqNumber::new(1), &request(77));
        forged.execute(SeqNumber::new(2), &request(78));

        let (replica, out) = deliver(replicas[3].clone(), &offer(2, 3, &forged));
        assert!(out.state_transferred.is_none());
        assert_eq!(replica.last_executed(), SeqNumber::ZERO);
        assert_eq!(replica.catch_up_offers.len(), 1);

        // The same replica repeating itself does not make a quorum.
        let (replica, out) = deliver(replica, &offer(2, 3, &forged));
        assert!(out.state_transferred.is_none());
        assert_eq!(replica.last_executed(), SeqNumber::ZERO);
    }

    #[test]
    fn snapshot_with_wrong_execution_point_is_rejected() {
        let replicas = cluster_with(small_config());
        let mut state = ServiceState::new();
        state.execute(SeqNumber::new(1), &request(1));
        let msg = sealed(
            2,
            Some(3),
            MessagePayload::StateResponse(StateResponse {
                seq: SeqNumber::new(5),
                snapshot: state,
            }),
        );
        let (replica, out) = deliver(replicas[3].clone(), &msg);
        assert!(out.state_transferred.is_none());
        assert_eq!(replica.violations().get(ViolationKind::InvalidCertificate), 1);
    }

    #[test]
    fn stalled_replica_installs_state_offered_by_weak_quorum() {
        let replicas = cluster_with(small_config());
        let mut ahead = ServiceState::new();
        for s in 1..=3 {
            ahead.execute(SeqNumber::new(s), &request(s));
        }

        let (stalled, out) = replicas[3].clone().process(ReplicaEvent::ClientRequest(request(3)));
        assert_eq!(stalled.pending_requests(), 1);
        assert!(out.state_transferred.is_none());

        let (stalled, out) = deliver(stalled, &offer(0, 3, &ahead));
        assert!(out.state_transferred.is_none());
        let (stalled, out) = deliver(stalled, &offer(1, 3, &ahead));

        assert_eq!(out.state_transferred, Some(SeqNumber::new(3)));
        assert_eq!(stalled.last_executed(), SeqNumber::new(3));
        assert_eq!(stalled.service().state_digest(), ahead.state_digest());
        assert_eq!(stalled.pending_requests(), 0);
        assert!(stalled.catch_up_offers.is_empty());
        // Seq 3 is not a checkpoint boundary, so no vote is cast for it.
        assert!(!stalled.snapshots.contains_key(&SeqNumber::new(3)));
    }

    #[test]
    fn peer_ahead_serves_live_state_for_catch_up() {
        let replicas = cluster_with(small_config());
        let mut ahead = replicas[0].clone();
        executed_through(&mut ahead, 3);

        let ask = sealed(
            3,
            None,
            MessagePayload::StateRequest(StateRequest {
                seq: SeqNumber::new(3),
            }),
        );
        let (ahead, out) = deliver(ahead, &ask);
        let Some(MessagePayload::StateResponse(response)) = out.messages.first().map(|m| &m.payload)
        else {
            panic!("expected a state response");
        };
        assert_eq!(response.seq, SeqNumber::new(3));
        assert_eq!(response.snapshot.state_digest(), ahead.service().state_digest());

        // A peer that has not reached the requested point stays quiet.
        let (_, out) = deliver(replicas[1].clone(), &ask);
        assert!(out.messages.is_empty());
    }
}
