//! # linkfail-types: Core types for `linkfail`
//!
//! Shared identifiers used by the replica state machine, the simulator and
//! the tooling around them:
//! - Replica and request identity ([`ReplicaId`], [`RequestId`])
//! - Protocol counters ([`ViewNumber`], [`SeqNumber`])
//! - Payload digests ([`Digest`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Replica Identity
// ============================================================================

/// Identifier of a replica within a cluster (`0..N`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(u8);

impl ReplicaId {
    /// Largest cluster the identifier space can address.
    pub const MAX_REPLICAS: usize = u8::MAX as usize;

    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }

    /// Returns every replica id of a cluster of `cluster_size` replicas.
    pub fn all(cluster_size: usize) -> impl Iterator<Item = ReplicaId> {
        debug_assert!(cluster_size <= Self::MAX_REPLICAS);
        (0..cluster_size).map(|i| ReplicaId(i as u8))
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for ReplicaId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<ReplicaId> for u8 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

// ============================================================================
// View Number
// ============================================================================

/// Monotonically increasing view number. The primary of view `v` is
/// replica `v mod N`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u64) -> Self {
        Self(view)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following view.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ViewNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ViewNumber> for u64 {
    fn from(view: ViewNumber) -> Self {
        view.0
    }
}

// ============================================================================
// Sequence Number
// ============================================================================

/// Position of a request in the totally ordered log.
///
/// Sequence 0 is the genesis checkpoint; the first request is assigned
/// sequence 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SeqNumber(u64);

impl SeqNumber {
    pub const ZERO: SeqNumber = SeqNumber(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Adds `n` positions, saturating at `u64::MAX`.
    pub fn plus(self, n: u64) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// Number of positions from `other` up to `self` (0 if `other` is ahead).
    pub fn distance_from(self, other: SeqNumber) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// Iterates `(self, end]`.
    pub fn range_exclusive_inclusive(self, end: SeqNumber) -> impl Iterator<Item = SeqNumber> {
        (self.0.saturating_add(1)..=end.0).map(SeqNumber)
    }
}

impl Display for SeqNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SeqNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SeqNumber> for u64 {
    fn from(seq: SeqNumber) -> Self {
        seq.0
    }
}

// ============================================================================
// Request Identity
// ============================================================================

/// Client-assigned request identifier, unique per run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RequestId(u64);

impl RequestId {
    /// Reserved id of the null request used to fill sequence gaps after a
    /// view change.
    pub const NULL: RequestId = RequestId(u64::MAX);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

// ============================================================================
// Digest
// ============================================================================

/// Length of a [`Digest`] in bytes.
pub const DIGEST_LENGTH: usize = 32;

/// A 32-byte BLAKE3 digest of a request payload or of replicated state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// All-zero digest; the state digest of an empty service.
    pub const ZERO: Digest = Digest([0u8; DIGEST_LENGTH]);

    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    /// Digest of an arbitrary byte string.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Extends a digest chain: `H(self || data)`.
    pub fn chain(&self, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Returns a digest that differs from `self`, used to model a replica
    /// lying about what it saw.
    pub fn corrupted(&self) -> Self {
        let mut bytes = self.0;
        bytes[0] ^= 0xff;
        Self(bytes)
    }

    /// Short hex prefix for logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}..)", self.short())
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
