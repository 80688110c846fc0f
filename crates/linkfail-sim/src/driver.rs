//! Client driver: issues requests, collects reply quorums, measures latency.
//!
//! The driver is a passive state machine like the replicas. The simulation
//! feeds it ticks, replies and timeouts and carries out the
//! [`ClientAction`]s it returns; every send still goes through the link
//! model.
//!
//! A request completes once `2f+1` distinct replicas reply with the same
//! `(seq, result)`. Two different certified values for one sequence number
//! are a safety violation.

use std::collections::BTreeMap;

use bytes::Bytes;
use linkfail_config::WorkloadSection;
use linkfail_pbft::{ClusterConfig, Reply, Request};
use linkfail_types::{Digest, ReplicaId, RequestId, SeqNumber, ViewNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::ms_to_ns;

/// Something the simulation must do on the driver's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Send to one replica.
    Send { to: ReplicaId, request: Request },

    /// Send to every replica (retry after a timeout).
    Broadcast { request: Request },

    /// Wake the driver at `at_ns` to issue the next request.
    ScheduleTick { at_ns: u64 },

    /// Wake the driver at `at_ns` if `request_id` is still open.
    ScheduleTimeout { request_id: RequestId, at_ns: u64 },
}

/// A request whose reply quorum formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRequest {
    pub request_id: RequestId,
    pub seq: SeqNumber,
    /// Highest view among the matching replies.
    pub view: ViewNumber,
    pub result: Digest,
    pub issued_at_ns: u64,
    pub completed_at_ns: u64,
    pub latency_ns: u64,
    pub retries: u32,
}

/// Two reply quorums certified different values for one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub seq: SeqNumber,
    pub first: String,
    pub second: String,
    pub time_ns: u64,
}

#[derive(Debug, Clone)]
struct Outstanding {
    request: Request,
    issued_at_ns: u64,
    retries: u32,
    /// Latest reply per replica.
    replies: BTreeMap<ReplicaId, Reply>,
}

// ============================================================================
// Client Driver
// ============================================================================

#[derive(Debug)]
pub struct ClientDriver {
    cluster: ClusterConfig,
    total_requests: u64,
    duration_ns: u64,
    window: usize,
    interval_ns: u64,
    timeout_ns: u64,

    known_view: ViewNumber,
    next_id: u64,
    issued: u64,
    retries: u64,
    last_issue_ns: Option<u64>,
    tick_pending: bool,

    outstanding: BTreeMap<RequestId, Outstanding>,
    completed: Vec<CompletedRequest>,
    certified: BTreeMap<SeqNumber, (RequestId, Digest)>,
    safety_violations: Vec<SafetyViolation>,
}

impl ClientDriver {
    pub fn new(cluster: ClusterConfig, workload: &WorkloadSection) -> Self {
        Self {
            cluster,
            total_requests: workload.requests,
            duration_ns: ms_to_ns(workload.duration_ms),
            window: workload.window.max(1),
            interval_ns: ms_to_ns(workload.request_interval_ms),
            timeout_ns: ms_to_ns(workload.client_timeout_ms).max(1),
            known_view: ViewNumber::ZERO,
            next_id: 1,
            issued: 0,
            retries: 0,
            last_issue_ns: None,
            tick_pending: false,
            outstanding: BTreeMap::new(),
            completed: Vec::new(),
            certified: BTreeMap::new(),
            safety_violations: Vec::new(),
        }
    }

    /// First actions of a run.
    pub fn start(&mut self, now_ns: u64) -> Vec<ClientAction> {
        self.tick_pending = true;
        self.on_tick(now_ns)
    }

    fn can_issue(&self, now_ns: u64) -> bool {
        self.outstanding.len() < self.window
            && (self.total_requests == 0 || self.issued < self.total_requests)
            && (self.duration_ns == 0 || now_ns < self.duration_ns)
    }

    pub fn on_tick(&mut self, now_ns: u64) -> Vec<ClientAction> {
        self.tick_pending = false;
        let mut actions = Vec::new();
        if !self.can_issue(now_ns) {
            return actions;
        }

        let request_id = RequestId::new(self.next_id);
        self.next_id += 1;
        self.issued += 1;
        self.last_issue_ns = Some(now_ns);

        let request = Request::new(request_id, Bytes::from(format!("op-{}", request_id.as_u64())));
        let primary = self.cluster.primary(self.known_view);
        debug!(request = %request_id, to = %primary, view = %self.known_view, "issuing request");

        self.outstanding.insert(
            request_id,
            Outstanding {
                request: request.clone(),
                issued_at_ns: now_ns,
                retries: 0,
                replies: BTreeMap::new(),
            },
        );
        actions.push(ClientAction::Send { to: primary, request });
        actions.push(ClientAction::ScheduleTimeout {
            request_id,
            at_ns: now_ns.saturating_add(self.timeout_ns),
        });
        self.schedule_next_tick(now_ns, &mut actions);
        actions
    }

    fn schedule_next_tick(&mut self, now_ns: u64, actions: &mut Vec<ClientAction>) {
        if self.tick_pending || !self.can_issue(now_ns) {
            return;
        }
        let at_ns = self
            .last_issue_ns
            .map_or(now_ns, |last| last.saturating_add(self.interval_ns))
            .max(now_ns);
        self.tick_pending = true;
        actions.push(ClientAction::ScheduleTick { at_ns });
    }

    /// Records a reply. Returns the completion when this reply closes a
    /// quorum.
    pub fn on_reply(&mut self, now_ns: u64, reply: Reply) -> (Vec<ClientAction>, Option<CompletedRequest>) {
        let mut actions = Vec::new();
        if reply.view > self.known_view {
            self.known_view = reply.view;
        }

        let quorum = self.cluster.quorum();
        let Some(open) = self.outstanding.get_mut(&reply.request_id) else {
            return (actions, None);
        };
        open.replies.insert(reply.replica, reply.clone());

        let matching: Vec<&Reply> = open
            .replies
            .values()
            .filter(|r| r.seq == reply.seq && r.result == reply.result)
            .collect();
        if matching.len() < quorum {
            return (actions, None);
        }
        let view = matching.iter().map(|r| r.view).max().unwrap_or(reply.view);

        let Some(open) = self.outstanding.remove(&reply.request_id) else {
            return (actions, None);
        };
        let done = CompletedRequest {
            request_id: reply.request_id,
            seq: reply.seq,
            view,
            result: reply.result,
            issued_at_ns: open.issued_at_ns,
            completed_at_ns: now_ns,
            latency_ns: now_ns.saturating_sub(open.issued_at_ns),
            retries: open.retries,
        };
        self.certify(now_ns, &done);
        debug!(
            request = %done.request_id,
            seq = %done.seq,
            view = %done.view,
            latency_ns = done.latency_ns,
            "request completed"
        );
        self.completed.push(done.clone());
        self.schedule_next_tick(now_ns, &mut actions);
        (actions, Some(done))
    }

    fn certify(&mut self, now_ns: u64, done: &CompletedRequest) {
        match self.certified.get(&done.seq) {
            Some((request_id, result)) if (*request_id, *result) != (done.request_id, done.result) => {
                let violation = SafetyViolation {
                    seq: done.seq,
                    first: format!("{request_id}/{}", result.short()),
                    second: format!("{}/{}", done.request_id, done.result.short()),
                    time_ns: now_ns,
                };
                warn!(seq = %done.seq, first = %violation.first, second = %violation.second, "conflicting reply quorums");
                self.safety_violations.push(violation);
            }
            Some(_) => {}
            None => {
                self.certified.insert(done.seq, (done.request_id, done.result));
            }
        }
    }

    /// Retries an open request by broadcasting it to every replica.
    pub fn on_timeout(&mut self, now_ns: u64, request_id: RequestId) -> Vec<ClientAction> {
        let Some(open) = self.outstanding.get_mut(&request_id) else {
            return Vec::new();
        };
        open.retries += 1;
        self.retries += 1;
        debug!(request = %request_id, retries = open.retries, "client timeout, broadcasting request");
        vec![
            ClientAction::Broadcast {
                request: open.request.clone(),
            },
            ClientAction::ScheduleTimeout {
                request_id,
                at_ns: now_ns.saturating_add(self.timeout_ns),
            },
        ]
    }

    /// Request budget met, or time budget spent with nothing left open.
    pub fn is_done(&self, now_ns: u64) -> bool {
        if self.total_requests > 0 && self.completed.len() as u64 >= self.total_requests {
            return true;
        }
        self.duration_ns > 0 && now_ns >= self.duration_ns && self.outstanding.is_empty()
    }

    pub fn known_view(&self) -> ViewNumber {
        self.known_view
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn completed(&self) -> &[CompletedRequest] {
        &self.completed
    }

    pub fn safety_violations(&self) -> &[SafetyViolation] {
        &self.safety_violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(requests: u64, window: usize) -> WorkloadSection {
        WorkloadSection {
            requests,
            window,
            ..WorkloadSection::default()
        }
    }

    fn driver(requests: u64, window: usize) -> ClientDriver {
        ClientDriver::new(ClusterConfig::new(4).expect("cluster"), &workload(requests, window))
    }

    fn reply(replica: u8, request: u64, seq: u64, view: u64, result: &[u8]) -> Reply {
        Reply {
            view: ViewNumber::new(view),
            request_id: RequestId::new(request),
            seq: SeqNumber::new(seq),
            replica: ReplicaId::new(replica),
            result: Digest::of(result),
        }
    }

    #[test]
    fn start_sends_first_request_to_primary() {
        let mut driver = driver(3, 1);
        let actions = driver.start(0);
        assert!(matches!(
            &actions[0],
            ClientAction::Send { to, request } if *to == ReplicaId::new(0) && request.request_id == RequestId::new(1)
        ));
        assert!(matches!(actions[1], ClientAction::ScheduleTimeout { at_ns: 2_000_000_000, .. }));
        assert_eq!(actions.len(), 2, "window of one leaves no room for a tick");
        assert_eq!(driver.issued(), 1);
    }

    #[test]
    fn quorum_of_matching_replies_completes() {
        let mut driver = driver(2, 1);
        driver.start(0);

        assert!(driver.on_reply(5, reply(0, 1, 1, 0, b"x")).1.is_none());
        assert!(driver.on_reply(6, reply(1, 1, 1, 0, b"y")).1.is_none());
        assert!(driver.on_reply(7, reply(2, 1, 1, 0, b"x")).1.is_none());
        let (actions, done) = driver.on_reply(9, reply(3, 1, 1, 0, b"x"));

        let done = done.expect("quorum formed");
        assert_eq!(done.seq, SeqNumber::new(1));
        assert_eq!(done.latency_ns, 9);
        assert_eq!(actions, vec![ClientAction::ScheduleTick { at_ns: 10_000_000 }]);
        assert!(!driver.is_done(9));

        driver.on_tick(10_000_000);
        for replica in 0..3 {
            driver.on_reply(20_000_000, reply(replica, 2, 2, 0, b"z"));
        }
        assert!(driver.is_done(20_000_000));
        assert!(driver.safety_violations().is_empty());
    }

    #[test]
    fn replies_update_known_view() {
        let mut driver = driver(2, 1);
        driver.start(0);
        for replica in 0..3 {
            driver.on_reply(1, reply(replica, 1, 1, 2, b"x"));
        }
        assert_eq!(driver.known_view(), ViewNumber::new(2));
        let actions = driver.on_tick(10_000_000);
        assert!(matches!(&actions[0], ClientAction::Send { to, .. } if *to == ReplicaId::new(2)));
    }

    #[test]
    fn timeout_broadcasts_open_request_only() {
        let mut driver = driver(1, 1);
        driver.start(0);
        let actions = driver.on_timeout(100, RequestId::new(1));
        assert!(matches!(&actions[0], ClientAction::Broadcast { request } if request.request_id == RequestId::new(1)));
        assert_eq!(driver.retries(), 1);

        for replica in 0..3 {
            driver.on_reply(200, reply(replica, 1, 1, 0, b"x"));
        }
        assert!(driver.on_timeout(300, RequestId::new(1)).is_empty());
        assert_eq!(driver.completed()[0].retries, 1);
    }

    #[test]
    fn conflicting_quorums_are_a_safety_violation() {
        let mut driver = driver(2, 2);
        driver.start(0);
        driver.on_tick(10_000_000);
        for replica in 0..3 {
            driver.on_reply(1, reply(replica, 1, 1, 0, b"x"));
        }
        for replica in 1..4 {
            driver.on_reply(2, reply(replica, 2, 1, 0, b"y"));
        }
        assert_eq!(driver.safety_violations().len(), 1);
        assert_eq!(driver.safety_violations()[0].seq, SeqNumber::new(1));
    }

    #[test]
    fn window_bounds_outstanding_requests() {
        let mut driver = driver(10, 3);
        let mut ticks = vec![0];
        while let Some(now) = ticks.pop() {
            for action in driver.on_tick(now) {
                if let ClientAction::ScheduleTick { at_ns } = action {
                    ticks.push(at_ns);
                }
            }
        }
        assert_eq!(driver.outstanding(), 3);
        assert_eq!(driver.issued(), 3);
    }

    #[test]
    fn duration_budget_stops_issuing() {
        let mut driver = ClientDriver::new(
            ClusterConfig::new(4).expect("cluster"),
            &WorkloadSection {
                requests: 0,
                duration_ms: 1,
                ..WorkloadSection::default()
            },
        );
        assert!(driver.on_tick(2_000_000).is_empty());
        assert!(driver.is_done(2_000_000));
        assert!(!driver.is_done(0));
    }
}
