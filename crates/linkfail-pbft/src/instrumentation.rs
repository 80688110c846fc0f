//! Protocol-violation accounting.
//!
//! Every message a replica discards is classified and counted here.
//! Violations are never fatal: the message is dropped and the replica
//! carries on. The simulator aggregates the per-replica counters into the
//! run metrics.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Why a message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// View lower than the replica's current view.
    StaleView,
    /// Same sender, phase and slot seen before.
    Duplicate,
    /// Digest conflicts with the accepted PRE-PREPARE, or does not match
    /// the carried request.
    DigestMismatch,
    /// Sequence outside the `(low, high]` watermark window.
    OutOfWindow,
    /// Authenticator missing or invalid.
    BadAuthenticator,
    /// PRE-PREPARE or NEW-VIEW from a replica that is not the primary.
    WrongPrimary,
    /// Embedded certificate or checkpoint proof failed validation.
    InvalidCertificate,
    /// NEW-VIEW whose re-proposals do not match the carried view changes.
    InvalidNewView,
    /// Sender outside the cluster.
    UnknownSender,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 9] = [
        ViolationKind::StaleView,
        ViolationKind::Duplicate,
        ViolationKind::DigestMismatch,
        ViolationKind::OutOfWindow,
        ViolationKind::BadAuthenticator,
        ViolationKind::WrongPrimary,
        ViolationKind::InvalidCertificate,
        ViolationKind::InvalidNewView,
        ViolationKind::UnknownSender,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ViolationKind::StaleView => "stale_view",
            ViolationKind::Duplicate => "duplicate",
            ViolationKind::DigestMismatch => "digest_mismatch",
            ViolationKind::OutOfWindow => "out_of_window",
            ViolationKind::BadAuthenticator => "bad_authenticator",
            ViolationKind::WrongPrimary => "wrong_primary",
            ViolationKind::InvalidCertificate => "invalid_certificate",
            ViolationKind::InvalidNewView => "invalid_new_view",
            ViolationKind::UnknownSender => "unknown_sender",
        }
    }
}

/// Per-kind violation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCounters {
    counts: BTreeMap<ViolationKind, u64>,
}

impl ViolationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ViolationKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    pub fn get(&self, kind: ViolationKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Non-zero counters in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = (ViolationKind, u64)> + '_ {
        self.counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(kind, count)| (*kind, *count))
    }
}

impl AddAssign<&ViolationCounters> for ViolationCounters {
    fn add_assign(&mut self, other: &ViolationCounters) {
        for (kind, count) in &other.counts {
            *self.counts.entry(*kind).or_insert(0) += count;
        }
    }
}
