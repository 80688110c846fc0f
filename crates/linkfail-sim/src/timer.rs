//! Per-replica timers in simulated time.
//!
//! Setting a timer schedules a [`EventKind::TimerExpiry`] on the event
//! queue. Cancelling only clears the handle's validity; the queued expiry
//! stays in the heap and is discarded when popped. Each replica has at most
//! one live timer per [`TimeoutKind`]: setting a kind again cancels the
//! previous handle.

use std::collections::BTreeMap;

use linkfail_pbft::{Timeout, TimeoutKind};
use linkfail_types::ReplicaId;
use serde::{Deserialize, Serialize};

use crate::event::{EventKind, EventQueue};

/// Identifies one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy)]
struct LiveTimer {
    replica: ReplicaId,
    timeout: Timeout,
}

#[derive(Debug, Default)]
pub struct TimerService {
    next_handle: u64,
    live: BTreeMap<TimerHandle, LiveTimer>,
    by_kind: BTreeMap<(ReplicaId, TimeoutKind), TimerHandle>,
    fired: u64,
    discarded: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `timeout` for `replica` to fire at `now_ns + duration_ns`.
    pub fn set_timer(
        &mut self,
        queue: &mut EventQueue,
        now_ns: u64,
        replica: ReplicaId,
        timeout: Timeout,
        duration_ns: u64,
    ) -> TimerHandle {
        if let Some(previous) = self.by_kind.remove(&(replica, timeout.kind)) {
            self.live.remove(&previous);
        }

        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.live.insert(handle, LiveTimer { replica, timeout });
        self.by_kind.insert((replica, timeout.kind), handle);
        queue.schedule(
            now_ns.saturating_add(duration_ns),
            EventKind::TimerExpiry { replica, handle },
        );
        handle
    }

    /// Invalidates `handle`. Returns false if it already fired or was
    /// cancelled.
    pub fn cancel_timer(&mut self, handle: TimerHandle) -> bool {
        match self.live.remove(&handle) {
            Some(timer) => {
                self.by_kind.remove(&(timer.replica, timer.timeout.kind));
                true
            }
            None => false,
        }
    }

    /// Cancels whatever timer of `kind` the replica has armed.
    pub fn cancel_kind(&mut self, replica: ReplicaId, kind: TimeoutKind) -> bool {
        match self.by_kind.get(&(replica, kind)).copied() {
            Some(handle) => self.cancel_timer(handle),
            None => false,
        }
    }

    /// Resolves a popped expiry. Returns the timeout to deliver, or `None`
    /// for a handle that was cancelled or superseded.
    pub fn fire(&mut self, handle: TimerHandle) -> Option<(ReplicaId, Timeout)> {
        match self.live.remove(&handle) {
            Some(timer) => {
                self.by_kind.remove(&(timer.replica, timer.timeout.kind));
                self.fired += 1;
                Some((timer.replica, timer.timeout))
            }
            None => {
                self.discarded += 1;
                None
            }
        }
    }

    pub fn is_armed(&self, replica: ReplicaId, kind: TimeoutKind) -> bool {
        self.by_kind.contains_key(&(replica, kind))
    }

    pub fn fired_count(&self) -> u64 {
        self.fired
    }

    /// Expiries popped after their handle was cancelled.
    pub fn discarded_count(&self) -> u64 {
        self.discarded
    }
}
