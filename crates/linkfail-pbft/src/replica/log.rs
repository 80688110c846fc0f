//! Slot arena for the `(low, high]` watermark window.
//!
//! Slots are stored densely in a ring indexed by `seq - low - 1`. Advancing
//! the low watermark pops released slots off the front and pushes fresh
//! ones at the back, so the arena never grows past the window width.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use linkfail_types::{Digest, ReplicaId, SeqNumber, ViewNumber};

use crate::message::{PrePrepare, PreparedProof, Request};

use super::CommittedEntry;

/// Per-view phase of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPhase {
    #[default]
    Idle,
    PrePrepared,
    Prepared,
    Committed,
}

/// Votes for one slot, keyed by `(view, digest)`.
type Votes = BTreeMap<(ViewNumber, Digest), BTreeSet<ReplicaId>>;

/// A decided slot waiting for (or past) execution.
#[derive(Debug, Clone)]
pub(crate) struct CommittedSlot {
    pub entry: CommittedEntry,
    pub request: Request,
}

/// One sequence number's agreement state.
#[derive(Debug, Clone)]
pub struct Slot {
    seq: SeqNumber,
    phase: SlotPhase,
    pre_prepare: Option<PrePrepare>,
    prepares: Votes,
    commits: Votes,
    prepared_proof: Option<PreparedProof>,
    pub(crate) committed: Option<CommittedSlot>,
    pub(crate) executed: bool,
}

impl Slot {
    fn new(seq: SeqNumber) -> Self {
        Self {
            seq,
            phase: SlotPhase::Idle,
            pre_prepare: None,
            prepares: Votes::new(),
            commits: Votes::new(),
            prepared_proof: None,
            committed: None,
            executed: false,
        }
    }

    pub fn seq(&self) -> SeqNumber {
        self.seq
    }

    pub fn phase(&self) -> SlotPhase {
        self.phase
    }

    /// Accepted PRE-PREPARE for the slot's current view.
    pub fn pre_prepare(&self) -> Option<&PrePrepare> {
        self.pre_prepare.as_ref()
    }

    /// Highest-view prepare certificate this replica has formed.
    pub fn prepared_proof(&self) -> Option<&PreparedProof> {
        self.prepared_proof.as_ref()
    }

    pub fn is_committed(&self) -> bool {
        self.committed.is_some()
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn committed_entry(&self) -> Option<&CommittedEntry> {
        self.committed.as_ref().map(|c| &c.entry)
    }

    pub(crate) fn prepare_voters(&self, view: ViewNumber, digest: Digest) -> Option<&BTreeSet<ReplicaId>> {
        self.prepares.get(&(view, digest))
    }

    pub(crate) fn commit_voters(&self, view: ViewNumber, digest: Digest) -> Option<&BTreeSet<ReplicaId>> {
        self.commits.get(&(view, digest))
    }

    /// Records the PRE-PREPARE for `view`; the primary's proposal counts as
    /// its prepare vote.
    pub(crate) fn accept_pre_prepare(&mut self, pre_prepare: PrePrepare, primary: ReplicaId) {
        debug_assert_eq!(pre_prepare.seq, self.seq);
        self.prepares
            .entry((pre_prepare.view, pre_prepare.digest))
            .or_default()
            .insert(primary);
        self.phase = SlotPhase::PrePrepared;
        self.pre_prepare = Some(pre_prepare);
    }

    /// Returns false if the vote was already present.
    pub(crate) fn add_prepare(&mut self, view: ViewNumber, digest: Digest, voter: ReplicaId) -> bool {
        self.prepares.entry((view, digest)).or_default().insert(voter)
    }

    pub(crate) fn add_commit(&mut self, view: ViewNumber, digest: Digest, voter: ReplicaId) -> bool {
        self.commits.entry((view, digest)).or_default().insert(voter)
    }

    pub(crate) fn mark_prepared(&mut self, proof: PreparedProof) {
        self.phase = SlotPhase::Prepared;
        let replace = self
            .prepared_proof
            .as_ref()
            .is_none_or(|existing| existing.view <= proof.view);
        if replace {
            self.prepared_proof = Some(proof);
        }
    }

    pub(crate) fn mark_committed_phase(&mut self) {
        self.phase = SlotPhase::Committed;
    }

    /// Forgets the per-view phase when a new view is installed. Prepared
    /// proofs and decisions survive; votes from older views are dropped.
    pub(crate) fn reset_for_view(&mut self, view: ViewNumber) {
        self.phase = SlotPhase::Idle;
        self.pre_prepare = None;
        self.prepares.retain(|(v, _), _| *v >= view);
        self.commits.retain(|(v, _), _| *v >= view);
    }
}

// ============================================================================
// Slot Log
// ============================================================================

/// Dense slot storage for the watermark window.
#[derive(Debug, Clone)]
pub struct SlotLog {
    low: SeqNumber,
    window: u64,
    slots: VecDeque<Slot>,
}

impl SlotLog {
    pub fn new(window: u64) -> Self {
        debug_assert!(window > 0, "watermark window must be non-empty");
        let low = SeqNumber::ZERO;
        let slots = low
            .range_exclusive_inclusive(low.plus(window))
            .map(Slot::new)
            .collect();
        Self { low, window, slots }
    }

    /// Low watermark `h`; slots at or below it are released.
    pub fn low(&self) -> SeqNumber {
        self.low
    }

    /// High watermark `H = h + window`.
    pub fn high(&self) -> SeqNumber {
        self.low.plus(self.window)
    }

    pub fn in_window(&self, seq: SeqNumber) -> bool {
        seq > self.low && seq <= self.high()
    }

    fn index(&self, seq: SeqNumber) -> Option<usize> {
        if !self.in_window(seq) {
            return None;
        }
        usize::try_from(seq.distance_from(self.low) - 1).ok()
    }

    pub fn get(&self, seq: SeqNumber) -> Option<&Slot> {
        self.index(seq).and_then(|i| self.slots.get(i))
    }

    pub(crate) fn get_mut(&mut self, seq: SeqNumber) -> Option<&mut Slot> {
        self.index(seq).and_then(|i| self.slots.get_mut(i))
    }

    /// Releases every slot at or below `new_low`.
    pub(crate) fn advance_low(&mut self, new_low: SeqNumber) {
        if new_low <= self.low {
            return;
        }
        let shift = new_low.distance_from(self.low);
        if shift >= self.window {
            self.slots = new_low
                .range_exclusive_inclusive(new_low.plus(self.window))
                .map(Slot::new)
                .collect();
        } else {
            let old_high = self.high();
            for _ in 0..shift {
                self.slots.pop_front();
            }
            for seq in old_high.range_exclusive_inclusive(new_low.plus(self.window)) {
                self.slots.push_back(Slot::new(seq));
            }
        }
        self.low = new_low;
        debug_assert_eq!(self.slots.len() as u64, self.window);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }
}
