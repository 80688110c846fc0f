//! Scheduled events and the priority queue that orders them.
//!
//! Events are totally ordered by `(time_ns, id)`: delivery time first, then
//! insertion order. Two events scheduled for the same instant always pop in
//! the order they were scheduled, which keeps runs reproducible.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use linkfail_pbft::{Message, Reply, Request};
use linkfail_types::{ReplicaId, RequestId};

use crate::timer::TimerHandle;

/// Insertion sequence number of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// What happens when an event fires.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A protocol message reaches its target replica.
    MessageArrival { to: ReplicaId, message: Box<Message> },

    /// A client request reaches a replica.
    RequestArrival { to: ReplicaId, request: Request },

    /// A replica's reply reaches the client.
    ReplyArrival { reply: Reply },

    /// A replica timer expires.
    TimerExpiry { replica: ReplicaId, handle: TimerHandle },

    /// The client may issue its next request.
    ClientTick,

    /// The client gives up waiting on a request's reply quorum.
    ClientTimeout { request_id: RequestId },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::MessageArrival { .. } => "message_arrival",
            EventKind::RequestArrival { .. } => "request_arrival",
            EventKind::ReplyArrival { .. } => "reply_arrival",
            EventKind::TimerExpiry { .. } => "timer_expiry",
            EventKind::ClientTick => "client_tick",
            EventKind::ClientTimeout { .. } => "client_timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub time_ns: u64,
    pub kind: EventKind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    /// Reversed so the max-heap pops the earliest event first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.time_ns, other.id).cmp(&(self.time_ns, self.id))
    }
}

// ============================================================================
// Event Queue
// ============================================================================

/// Min-queue of scheduled events.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    next_id: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, time_ns: u64, kind: EventKind) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.heap.push(Event { id, time_ns, kind });
        id
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop()
    }

    pub fn next_time(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.time_ns)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Total events ever scheduled.
    pub fn scheduled_count(&self) -> u64 {
        self.next_id
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pops_in_time_order() {
        let mut queue = EventQueue::new();
        queue.schedule(30, EventKind::ClientTick);
        queue.schedule(10, EventKind::ClientTick);
        queue.schedule(20, EventKind::ClientTick);

        let times: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|e| e.time_ns).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn ties_break_by_insertion() {
        let mut queue = EventQueue::new();
        let first = queue.schedule(5, EventKind::ClientTick);
        let second = queue.schedule(5, EventKind::ClientTimeout {
            request_id: RequestId::new(1),
        });

        assert_eq!(queue.next_time(), Some(5));
        assert_eq!(queue.pop().map(|e| e.id), Some(first));
        assert_eq!(queue.pop().map(|e| e.id), Some(second));
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn order_is_time_then_insertion(times in proptest::collection::vec(0u64..50, 1..200)) {
            let mut queue = EventQueue::new();
            for t in &times {
                queue.schedule(*t, EventKind::ClientTick);
            }
            prop_assert_eq!(queue.scheduled_count(), times.len() as u64);

            let mut last: Option<(u64, EventId)> = None;
            while let Some(event) = queue.pop() {
                if let Some(prev) = last {
                    prop_assert!(prev < (event.time_ns, event.id));
                }
                last = Some((event.time_ns, event.id));
            }
        }
    }
}
