//! Invariant checkers for simulation testing.
//!
//! Checkers observe what honest replicas report after every transition and
//! flag safety breaches. In permissive mode a violation is recorded and the
//! run continues; in strict mode the loop stops with
//! [`SimError::InvariantViolation`].
//!
//! # Available Checkers
//!
//! - [`AgreementChecker`]: one committed value per sequence, cluster-wide
//! - [`CommitOrderChecker`]: gap-free increasing commits per replica
//! - [`ViewMonotonicChecker`]: views never go backwards per replica
//! - [`PartitionChecker`]: isolated replicas never appear in certificates

use std::collections::{BTreeMap, BTreeSet};

use linkfail_pbft::CommittedEntry;
use linkfail_types::{Digest, ReplicaId, SeqNumber, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::SimError;

// ============================================================================
// Invariant Result
// ============================================================================

/// Result of an invariant check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Ok,
    Violated {
        invariant: String,
        message: String,
        context: Vec<(String, String)>,
    },
}

impl InvariantResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, InvariantResult::Ok)
    }

    /// Converts to a `SimError` if violated.
    pub fn into_error(self, time_ns: u64) -> Option<SimError> {
        match self {
            InvariantResult::Ok => None,
            InvariantResult::Violated {
                invariant, message, ..
            } => Some(SimError::InvariantViolation {
                invariant,
                message,
                time_ns,
            }),
        }
    }

    /// Converts to a report record if violated.
    pub fn into_record(self, time_ns: u64) -> Option<ViolationRecord> {
        match self {
            InvariantResult::Ok => None,
            InvariantResult::Violated {
                invariant, message, ..
            } => Some(ViolationRecord {
                invariant,
                message,
                time_ns,
            }),
        }
    }
}

/// A violation kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub invariant: String,
    pub message: String,
    pub time_ns: u64,
}

// ============================================================================
// Invariant Checker Trait
// ============================================================================

pub trait InvariantChecker {
    fn name(&self) -> &'static str;

    /// Resets the checker to its initial state.
    fn reset(&mut self);
}

// ============================================================================
// Agreement Checker
// ============================================================================

/// At most one committed digest per sequence number across all replicas.
#[derive(Debug, Default)]
pub struct AgreementChecker {
    decided: BTreeMap<SeqNumber, (Digest, ReplicaId)>,
    checks: u64,
}

impl AgreementChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_commit(&mut self, replica: ReplicaId, entry: &CommittedEntry) -> InvariantResult {
        self.checks += 1;
        match self.decided.get(&entry.seq) {
            Some((digest, first)) if *digest != entry.digest => InvariantResult::Violated {
                invariant: "agreement".to_string(),
                message: format!(
                    "seq {} committed as {} at replica {} but as {} at replica {}",
                    entry.seq,
                    digest.short(),
                    first,
                    entry.digest.short(),
                    replica
                ),
                context: vec![
                    ("seq".to_string(), entry.seq.to_string()),
                    ("first_replica".to_string(), first.to_string()),
                    ("replica".to_string(), replica.to_string()),
                ],
            },
            Some(_) => InvariantResult::Ok,
            None => {
                self.decided.insert(entry.seq, (entry.digest, replica));
                InvariantResult::Ok
            }
        }
    }

    /// Distinct sequences committed by anyone.
    pub fn decided_count(&self) -> usize {
        self.decided.len()
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }
}

impl InvariantChecker for AgreementChecker {
    fn name(&self) -> &'static str {
        "AgreementChecker"
    }

    fn reset(&mut self) {
        self.decided.clear();
        self.checks = 0;
    }
}

// ============================================================================
// Commit Order Checker
// ============================================================================

/// Each replica commits `last + 1`, except across a state transfer, which
/// moves its execution point forward wholesale.
#[derive(Debug, Default)]
pub struct CommitOrderChecker {
    last: BTreeMap<ReplicaId, SeqNumber>,
}

impl CommitOrderChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_commit(&mut self, replica: ReplicaId, seq: SeqNumber) -> InvariantResult {
        let last = self.last.get(&replica).copied().unwrap_or(SeqNumber::ZERO);
        let expected = last.next();
        if seq != expected {
            return InvariantResult::Violated {
                invariant: "commit_order".to_string(),
                message: format!("replica {replica} committed seq {seq}, expected {expected}"),
                context: vec![
                    ("replica".to_string(), replica.to_string()),
                    ("last".to_string(), last.to_string()),
                ],
            };
        }
        self.last.insert(replica, seq);
        InvariantResult::Ok
    }

    pub fn check_state_transfer(&mut self, replica: ReplicaId, seq: SeqNumber) -> InvariantResult {
        let last = self.last.get(&replica).copied().unwrap_or(SeqNumber::ZERO);
        if seq < last {
            return InvariantResult::Violated {
                invariant: "commit_order".to_string(),
                message: format!("replica {replica} transferred state back to {seq} from {last}"),
                context: vec![("replica".to_string(), replica.to_string())],
            };
        }
        self.last.insert(replica, seq);
        InvariantResult::Ok
    }

    pub fn last_committed(&self, replica: ReplicaId) -> SeqNumber {
        self.last.get(&replica).copied().unwrap_or(SeqNumber::ZERO)
    }
}

impl InvariantChecker for CommitOrderChecker {
    fn name(&self) -> &'static str {
        "CommitOrderChecker"
    }

    fn reset(&mut self) {
        self.last.clear();
    }
}

// ============================================================================
// View Monotonic Checker
// ============================================================================

#[derive(Debug, Default)]
pub struct ViewMonotonicChecker {
    views: BTreeMap<ReplicaId, ViewNumber>,
}

impl ViewMonotonicChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_view(&mut self, replica: ReplicaId, view: ViewNumber) -> InvariantResult {
        let current = self.views.get(&replica).copied().unwrap_or(ViewNumber::ZERO);
        if view < current {
            return InvariantResult::Violated {
                invariant: "view_monotonic".to_string(),
                message: format!("replica {replica} moved from view {current} back to {view}"),
                context: vec![("replica".to_string(), replica.to_string())],
            };
        }
        self.views.insert(replica, view);
        InvariantResult::Ok
    }
}

impl InvariantChecker for ViewMonotonicChecker {
    fn name(&self) -> &'static str {
        "ViewMonotonicChecker"
    }

    fn reset(&mut self) {
        self.views.clear();
    }
}

// ============================================================================
// Partition Checker
// ============================================================================

/// Replicas cut off by the link policy cannot contribute to certificates.
#[derive(Debug, Default)]
pub struct PartitionChecker {
    isolated: BTreeSet<ReplicaId>,
}

impl PartitionChecker {
    pub fn new(isolated: BTreeSet<ReplicaId>) -> Self {
        Self { isolated }
    }

    pub fn isolated(&self) -> &BTreeSet<ReplicaId> {
        &self.isolated
    }

    pub fn check_commit(&self, replica: ReplicaId, entry: &CommittedEntry) -> InvariantResult {
        let offender = entry
            .prepare_certificate
            .iter()
            .chain(&entry.commit_certificate)
            .find(|voter| self.isolated.contains(voter));
        match offender {
            Some(voter) => InvariantResult::Violated {
                invariant: "partition".to_string(),
                message: format!(
                    "isolated replica {voter} appears in a certificate for seq {} at replica {replica}",
                    entry.seq
                ),
                context: vec![("seq".to_string(), entry.seq.to_string())],
            },
            None => InvariantResult::Ok,
        }
    }
}

impl InvariantChecker for PartitionChecker {
    fn name(&self) -> &'static str {
        "PartitionChecker"
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkfail_types::RequestId;

    fn entry(seq: u64, op: &[u8], prepare: &[u8], commit: &[u8]) -> CommittedEntry {
        CommittedEntry {
            seq: SeqNumber::new(seq),
            view: ViewNumber::ZERO,
            digest: Digest::of(op),
            request_id: RequestId::new(seq),
            prepare_certificate: prepare.iter().copied().map(ReplicaId::new).collect(),
            commit_certificate: commit.iter().copied().map(ReplicaId::new).collect(),
        }
    }

    #[test]
    fn agreement_flags_conflicting_digest() {
        let mut checker = AgreementChecker::new();
        assert!(checker.check_commit(ReplicaId::new(0), &entry(1, b"a", &[], &[])).is_ok());
        assert!(checker.check_commit(ReplicaId::new(1), &entry(1, b"a", &[], &[])).is_ok());

        let result = checker.check_commit(ReplicaId::new(2), &entry(1, b"b", &[], &[]));
        assert!(matches!(result, InvariantResult::Violated { ref invariant, .. } if invariant == "agreement"));
        assert_eq!(checker.decided_count(), 1);

        checker.reset();
        assert_eq!(checker.checks(), 0);
        assert!(checker.check_commit(ReplicaId::new(2), &entry(1, b"b", &[], &[])).is_ok());
    }

    #[test]
    fn commit_order_requires_gap_free_sequence() {
        let mut checker = CommitOrderChecker::new();
        let r = ReplicaId::new(3);
        assert!(checker.check_commit(r, SeqNumber::new(1)).is_ok());
        assert!(checker.check_commit(r, SeqNumber::new(2)).is_ok());
        assert!(!checker.check_commit(r, SeqNumber::new(4)).is_ok());
        assert!(!checker.check_commit(r, SeqNumber::new(2)).is_ok());

        assert!(checker.check_state_transfer(r, SeqNumber::new(8)).is_ok());
        assert!(checker.check_commit(r, SeqNumber::new(9)).is_ok());
        assert!(!checker.check_state_transfer(r, SeqNumber::new(4)).is_ok());
        assert_eq!(checker.last_committed(r), SeqNumber::new(9));
    }

    #[test]
    fn views_never_decrease() {
        let mut checker = ViewMonotonicChecker::new();
        let r = ReplicaId::new(1);
        assert!(checker.check_view(r, ViewNumber::new(2)).is_ok());
        assert!(checker.check_view(r, ViewNumber::new(2)).is_ok());
        let violation = checker.check_view(r, ViewNumber::new(1));
        let error = violation.into_error(77).expect("violation converts");
        assert!(matches!(error, SimError::InvariantViolation { time_ns: 77, .. }));
    }

    #[test]
    fn partition_flags_isolated_voter() {
        let checker = PartitionChecker::new(BTreeSet::from([ReplicaId::new(3)]));
        let r = ReplicaId::new(0);
        assert!(checker.check_commit(r, &entry(1, b"a", &[0, 1, 2], &[0, 1, 2])).is_ok());

        let record = checker
            .check_commit(r, &entry(2, b"a", &[0, 1, 2], &[0, 1, 3]))
            .into_record(5)
            .expect("violation recorded");
        assert_eq!(record.invariant, "partition");
        assert_eq!(record.time_ns, 5);
    }
}
