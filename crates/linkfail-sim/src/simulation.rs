//! The discrete-event loop.
//!
//! One global loop pops the earliest event, hands it to the replica (or the
//! client driver) it targets, and routes everything the transition produced:
//! messages and replies pass the link oracle and survivors are scheduled at
//! `now + processing + link delay (+ behaviour delay)`, timer commands go to
//! the [`TimerService`], and commits and view changes feed the invariant
//! checkers and metrics.
//!
//! ```text
//!   driver ──Request──► link ──► queue ──► replica.process()
//!     ▲                                       │
//!     │                      messages ◄───────┤──► timers ──► queue
//!     └── link ◄── Reply ◄────────────────────┘──► checkers, metrics
//! ```

use std::collections::{BTreeMap, BTreeSet};

use linkfail_config::ExperimentConfig;
use linkfail_pbft::{
    Authenticator, ByzantineBehavior, ClusterConfig, CommittedEntry, Message, MessageKind, Reply,
    ReplicaEvent, ReplicaOutput, ReplicaState, Request, Timeout, TimerCommand,
};
use linkfail_types::{ReplicaId, SeqNumber};
use tracing::{debug, info, trace, warn};

use crate::clock::{SimClock, ms_to_ns};
use crate::driver::{ClientAction, ClientDriver, CompletedRequest};
use crate::error::SimError;
use crate::event::{Event, EventKind, EventQueue};
use crate::event_log::{Decision, EventLog};
use crate::invariant::{
    AgreementChecker, CommitOrderChecker, InvariantResult, PartitionChecker, ViewMonotonicChecker,
};
use crate::metrics::{LatencyStats, MetricsCollector, Outcome, RunReport};
use crate::network::{Endpoint, LinkDecision, LinkModel, LinkOracle, LinkPolicy, LinkStats};
use crate::result_log::ResultLog;
use crate::rng::SimRng;
use crate::shutdown::ShutdownSignal;
use crate::timer::TimerService;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    WorkloadDone,
    Horizon,
    MaxEvents,
    QueueDrained,
    Shutdown,
}

impl StopReason {
    fn describe(self) -> &'static str {
        match self {
            StopReason::WorkloadDone => "workload done",
            StopReason::Horizon => "simulated time horizon reached",
            StopReason::MaxEvents => "event budget exhausted",
            StopReason::QueueDrained => "no events left",
            StopReason::Shutdown => "shutdown requested",
        }
    }
}

// ============================================================================
// Simulation
// ============================================================================

pub struct Simulation {
    seed: u64,
    cluster: ClusterConfig,
    replicas: Vec<Option<ReplicaState>>,
    behaviors: Vec<ByzantineBehavior>,
    authenticator: Authenticator,

    queue: EventQueue,
    clock: SimClock,
    timers: TimerService,
    oracle: Box<dyn LinkOracle>,
    link_stats: LinkStats,
    next_message_id: u64,

    driver: ClientDriver,
    metrics: MetricsCollector,
    agreement: AgreementChecker,
    commit_order: CommitOrderChecker,
    views: ViewMonotonicChecker,
    partition: PartitionChecker,

    event_log: EventLog,
    result_log: Option<ResultLog>,
    shutdown: Option<ShutdownSignal>,

    processing_delay_ns: u64,
    horizon_ns: u64,
    max_events: u64,
    strict: bool,
    mean_probability: f64,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("seed", &self.seed)
            .field("cluster", &self.cluster)
            .field("now_ns", &self.clock.now())
            .field("oracle", &self.oracle.name())
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Builds a run whose links follow the configured Bernoulli policy.
    pub fn new(config: &ExperimentConfig) -> Result<Self, SimError> {
        config.validate()?;
        let mut rng = SimRng::new(config.run.seed);
        let model = LinkModel::from_config(config, &mut rng)?;
        Self::with_oracle(config, Box::new(model))
    }

    /// Builds a run whose link decisions come from `oracle`.
    pub fn with_oracle(config: &ExperimentConfig, oracle: Box<dyn LinkOracle>) -> Result<Self, SimError> {
        config.validate()?;
        let replica_config = config.replica_config()?;
        let cluster = replica_config.cluster;
        let n = cluster.size();

        let policy = LinkPolicy::from_config(config)?;
        let isolated = policy.isolated_replicas(n);
        if !isolated.is_empty() {
            info!(isolated = ?isolated, "link policy isolates replicas");
        }

        let assigned = config.behaviors();
        let behaviors = cluster
            .replicas()
            .map(|id| assigned.get(&id).copied().unwrap_or_default())
            .collect();

        let authenticator = Authenticator::from_seed(config.run.seed);
        let replicas = cluster
            .replicas()
            .map(|id| Some(ReplicaState::new(id, replica_config, authenticator.clone())))
            .collect();

        Ok(Self {
            seed: config.run.seed,
            cluster,
            replicas,
            behaviors,
            authenticator,
            queue: EventQueue::new(),
            clock: SimClock::new(),
            timers: TimerService::new(),
            oracle,
            link_stats: LinkStats::new(),
            next_message_id: 0,
            driver: ClientDriver::new(cluster, &config.workload),
            metrics: MetricsCollector::new(),
            agreement: AgreementChecker::new(),
            commit_order: CommitOrderChecker::new(),
            views: ViewMonotonicChecker::new(),
            partition: PartitionChecker::new(isolated),
            event_log: EventLog::disabled(),
            result_log: None,
            shutdown: None,
            processing_delay_ns: ms_to_ns(config.network.processing_delay_ms),
            horizon_ns: ms_to_ns(config.run.horizon_ms),
            max_events: config.run.max_events,
            strict: config.run.strict,
            mean_probability: policy.mean_probability(n),
        })
    }

    /// Records every decision into an [`EventLog`].
    pub fn with_event_log(mut self) -> Self {
        self.event_log = EventLog::new(self.seed);
        self
    }

    pub fn with_result_log(mut self, log: ResultLog) -> Self {
        self.result_log = Some(log);
        self
    }

    /// Stops the run between events once `signal` is triggered.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn into_event_log(self) -> EventLog {
        self.event_log
    }

    pub fn result_log(&self) -> Option<&ResultLog> {
        self.result_log.as_ref()
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&ReplicaState> {
        self.replicas.get(id.as_usize()).and_then(Option::as_ref)
    }

    pub fn completed(&self) -> &[CompletedRequest] {
        self.driver.completed()
    }

    pub fn link_stats(&self) -> &LinkStats {
        &self.link_stats
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // ========================================================================
    // Main Loop
    // ========================================================================

    /// Runs until the workload finishes or a limit is hit.
    ///
    /// Only a strict-mode invariant violation, a replay failure or a log
    /// write failure return `Err`; everything else ends up in the report.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        info!(
            seed = self.seed,
            nodes = self.cluster.size(),
            faults = self.cluster.faults(),
            p = self.mean_probability,
            oracle = self.oracle.name(),
            "starting simulation"
        );

        let actions = self.driver.start(self.clock.now());
        self.apply_client_actions(actions)?;

        let stop = loop {
            if self.driver.is_done(self.clock.now()) {
                break StopReason::WorkloadDone;
            }
            if self.shutdown.as_ref().is_some_and(ShutdownSignal::is_triggered) {
                break StopReason::Shutdown;
            }
            if self.metrics.events_processed() >= self.max_events {
                break StopReason::MaxEvents;
            }
            match self.queue.next_time() {
                None => break StopReason::QueueDrained,
                Some(at) if at > self.horizon_ns => break StopReason::Horizon,
                Some(_) => {}
            }
            let Some(event) = self.queue.pop() else {
                break StopReason::QueueDrained;
            };

            self.clock.advance_to(event.time_ns);
            self.metrics.record_event();
            trace!(
                time_ns = event.time_ns,
                event = event.id.as_u64(),
                kind = event.kind.name(),
                "processing event"
            );
            self.handle(event)?;
        };

        let report = self.finish(stop);
        if let Some(log) = self.result_log.as_mut() {
            log.summary(&report)?;
        }
        Ok(report)
    }

    fn handle(&mut self, event: Event) -> Result<(), SimError> {
        let now = event.time_ns;
        match event.kind {
            EventKind::MessageArrival { to, message } => {
                self.step(to, ReplicaEvent::Message(message))?;
            }
            EventKind::RequestArrival { to, request } => {
                self.step(to, ReplicaEvent::ClientRequest(request))?;
            }
            EventKind::ReplyArrival { reply } => {
                let (actions, completed) = self.driver.on_reply(now, reply);
                if let Some(done) = completed {
                    self.event_log.log(
                        now,
                        Decision::RequestCompleted {
                            request_id: done.request_id,
                            seq: done.seq,
                            view: done.view,
                            latency_ns: done.latency_ns,
                        },
                    );
                    if let Some(log) = self.result_log.as_mut() {
                        log.request_completed(&done)?;
                    }
                }
                self.apply_client_actions(actions)?;
            }
            EventKind::TimerExpiry { replica, handle } => {
                if let Some((replica, timeout)) = self.timers.fire(handle) {
                    debug!(replica = %replica, kind = timeout.kind.name(), view = %timeout.view, "timer fired");
                    self.event_log.log(
                        now,
                        Decision::TimerFired {
                            replica,
                            kind: timeout.kind,
                            view: timeout.view,
                        },
                    );
                    self.step(replica, ReplicaEvent::Timeout(timeout))?;
                } else {
                    trace!(replica = %replica, "discarding cancelled timer");
                }
            }
            EventKind::ClientTick => {
                let actions = self.driver.on_tick(now);
                self.apply_client_actions(actions)?;
            }
            EventKind::ClientTimeout { request_id } => {
                let actions = self.driver.on_timeout(now, request_id);
                self.apply_client_actions(actions)?;
            }
        }
        Ok(())
    }

    /// Feeds one event to a replica and routes its output.
    fn step(&mut self, id: ReplicaId, event: ReplicaEvent) -> Result<(), SimError> {
        let Some(slot) = self.replicas.get_mut(id.as_usize()) else {
            return Ok(());
        };
        let Some(replica) = slot.take() else {
            return Ok(());
        };
        let (replica, output) = replica.process(event);
        *slot = Some(replica);
        self.absorb(id, output)
    }

    // ========================================================================
    // Output Routing
    // ========================================================================

    fn absorb(&mut self, id: ReplicaId, output: ReplicaOutput) -> Result<(), SimError> {
        let now = self.clock.now();
        let honest = self.behavior(id).is_honest();

        if let Some(view) = output.view_change_started {
            info!(replica = %id, view = %view, "view change started");
            self.metrics.record_view_change_started();
            self.event_log.log(now, Decision::ViewChangeStarted { replica: id, view });
        }
        if let Some(seq) = output.state_transferred {
            info!(replica = %id, seq = %seq, "state transferred");
            self.metrics.record_state_transfer();
            self.event_log.log(now, Decision::StateTransferred { replica: id, seq });
            if honest {
                let result = self.commit_order.check_state_transfer(id, seq);
                self.observe(result)?;
            }
        }
        for entry in &output.committed {
            self.on_committed(id, entry, honest)?;
        }
        if let Some(view) = output.view_installed {
            info!(replica = %id, view = %view, "view installed");
            self.event_log.log(now, Decision::ViewInstalled { replica: id, view });
            if honest {
                self.metrics.record_view_installed(view);
                let result = self.views.check_view(id, view);
                self.observe(result)?;
            }
        }

        for command in output.timers {
            self.apply_timer(id, command);
        }
        for message in output.messages {
            self.send_message(id, message)?;
        }
        for reply in output.replies {
            self.send_reply(id, reply)?;
        }
        Ok(())
    }

    fn on_committed(&mut self, id: ReplicaId, entry: &CommittedEntry, honest: bool) -> Result<(), SimError> {
        trace!(replica = %id, seq = %entry.seq, view = %entry.view, request = %entry.request_id, "committed");
        self.event_log.log(
            self.clock.now(),
            Decision::Committed {
                replica: id,
                seq: entry.seq,
                view: entry.view,
                request_id: entry.request_id,
                digest: entry.digest,
            },
        );
        if !honest {
            return Ok(());
        }
        let agreement = self.agreement.check_commit(id, entry);
        self.observe(agreement)?;
        let order = self.commit_order.check_commit(id, entry.seq);
        self.observe(order)?;
        let partition = self.partition.check_commit(id, entry);
        self.observe(partition)
    }

    /// Records a violation, or stops the run in strict mode.
    fn observe(&mut self, result: InvariantResult) -> Result<(), SimError> {
        if result.is_ok() {
            return Ok(());
        }
        let now = self.clock.now();
        if self.strict {
            return match result.into_error(now) {
                Some(error) => Err(error),
                None => Ok(()),
            };
        }
        if let Some(record) = result.into_record(now) {
            warn!(invariant = %record.invariant, message = %record.message, "invariant violated");
            self.metrics.record_invariant_violation(record);
        }
        Ok(())
    }

    fn apply_timer(&mut self, id: ReplicaId, command: TimerCommand) {
        match command {
            TimerCommand::Set { kind, view, after_ns } => {
                self.timers.set_timer(
                    &mut self.queue,
                    self.clock.now(),
                    id,
                    Timeout { kind, view },
                    after_ns,
                );
            }
            TimerCommand::Cancel { kind } => {
                self.timers.cancel_kind(id, kind);
            }
        }
    }

    fn behavior(&self, id: ReplicaId) -> ByzantineBehavior {
        self.behaviors.get(id.as_usize()).copied().unwrap_or_default()
    }

    fn send_message(&mut self, from: ReplicaId, message: Message) -> Result<(), SimError> {
        let outbound = self.behavior(from).shape(message, &self.cluster, &self.authenticator);
        for out in outbound {
            let targets: Vec<ReplicaId> = match out.message.to {
                Some(to) => vec![to],
                None => self.cluster.replicas().filter(|r| *r != from).collect(),
            };
            for to in targets {
                let copy = if out.message.is_broadcast() {
                    out.message.retarget(to)
                } else {
                    out.message.clone()
                };
                let kind = copy.payload.kind();
                let Some(delay) = self.link(Endpoint::Replica(from), Endpoint::Replica(to), kind)? else {
                    continue;
                };
                let at = self.clock.now() + self.processing_delay_ns + delay + out.extra_delay_ns;
                self.queue.schedule(
                    at,
                    EventKind::MessageArrival {
                        to,
                        message: Box::new(copy),
                    },
                );
            }
        }
        Ok(())
    }

    fn send_reply(&mut self, from: ReplicaId, reply: Reply) -> Result<(), SimError> {
        let Some(extra) = self.behavior(from).shape_reply() else {
            return Ok(());
        };
        let Some(delay) = self.link(Endpoint::Replica(from), Endpoint::Client, MessageKind::Reply)? else {
            return Ok(());
        };
        let at = self.clock.now() + self.processing_delay_ns + delay + extra;
        self.queue.schedule(at, EventKind::ReplyArrival { reply });
        Ok(())
    }

    fn send_request(&mut self, to: ReplicaId, request: Request) -> Result<(), SimError> {
        self.event_log.log(
            self.clock.now(),
            Decision::RequestIssued {
                request_id: request.request_id,
                to: Some(to),
            },
        );
        if let Some(delay) = self.link(Endpoint::Client, Endpoint::Replica(to), MessageKind::Request)? {
            let at = self.clock.now() + delay;
            self.queue.schedule(at, EventKind::RequestArrival { to, request });
        }
        Ok(())
    }

    /// Asks the oracle about one attempted delivery. Returns the link delay
    /// for a survivor, `None` for a drop.
    fn link(&mut self, src: Endpoint, dst: Endpoint, kind: MessageKind) -> Result<Option<u64>, SimError> {
        let message_id = self.next_message_id;
        self.next_message_id += 1;

        let decision = self.oracle.decide(message_id, src, dst, kind)?;
        self.link_stats.record(src, dst, decision);
        self.event_log
            .log(self.clock.now(), Decision::link(message_id, src, dst, kind, decision));

        match decision {
            LinkDecision::Deliver { delay_ns } => Ok(Some(delay_ns)),
            LinkDecision::Drop => {
                trace!(message = message_id, src = %src, dst = %dst, kind = %kind, "dropped");
                Ok(None)
            }
        }
    }

    fn apply_client_actions(&mut self, actions: Vec<ClientAction>) -> Result<(), SimError> {
        for action in actions {
            match action {
                ClientAction::Send { to, request } => self.send_request(to, request)?,
                ClientAction::Broadcast { request } => {
                    self.event_log.log(
                        self.clock.now(),
                        Decision::RequestIssued {
                            request_id: request.request_id,
                            to: None,
                        },
                    );
                    let targets: Vec<ReplicaId> = self.cluster.replicas().collect();
                    for to in targets {
                        if let Some(delay) =
                            self.link(Endpoint::Client, Endpoint::Replica(to), MessageKind::Request)?
                        {
                            let at = self.clock.now() + delay;
                            self.queue.schedule(
                                at,
                                EventKind::RequestArrival {
                                    to,
                                    request: request.clone(),
                                },
                            );
                        }
                    }
                }
                ClientAction::ScheduleTick { at_ns } => {
                    self.queue.schedule(at_ns, EventKind::ClientTick);
                }
                ClientAction::ScheduleTimeout { request_id, at_ns } => {
                    self.queue.schedule(at_ns, EventKind::ClientTimeout { request_id });
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Report
    // ========================================================================

    fn finish(&self, stop: StopReason) -> RunReport {
        let safety_violations = self.driver.safety_violations().to_vec();
        let agreement_failures = self
            .metrics
            .invariant_violations()
            .iter()
            .filter(|v| v.invariant == "agreement")
            .count();

        let outcome = if !safety_violations.is_empty() || agreement_failures > 0 {
            Outcome::SafetyViolation {
                count: safety_violations.len() + agreement_failures,
            }
        } else {
            match stop {
                StopReason::WorkloadDone => Outcome::Converged,
                StopReason::Shutdown => Outcome::Cancelled,
                other => Outcome::NonConverged {
                    reason: format!(
                        "{} with {} of {} requests completed",
                        other.describe(),
                        self.driver.completed().len(),
                        self.driver.issued()
                    ),
                },
            }
        };

        let mut protocol_violations: BTreeMap<String, u64> = BTreeMap::new();
        for replica in self.replicas.iter().flatten() {
            for (kind, count) in replica.violations().iter() {
                *protocol_violations.entry(kind.name().to_string()).or_default() += count;
            }
        }

        let completed = self.driver.completed();
        let latencies: Vec<u64> = completed.iter().map(|c| c.latency_ns).collect();
        let final_time_ns = self.clock.now();

        let report = RunReport {
            seed: self.seed,
            nodes: self.cluster.size(),
            faults: self.cluster.faults(),
            drop_probability: self.mean_probability,
            link_oracle: self.oracle.name().to_string(),
            outcome,
            requests_issued: self.driver.issued(),
            requests_completed: completed.len() as u64,
            client_retries: self.driver.retries(),
            latency: LatencyStats::from_latencies(&latencies),
            throughput_rps: RunReport::throughput(completed.len() as u64, final_time_ns),
            view_changes: self.metrics.view_changes(),
            view_change_attempts: self.metrics.view_change_attempts(),
            max_view: self.metrics.max_view().as_u64(),
            state_transfers: self.metrics.state_transfers(),
            links: self.link_stats.total(),
            protocol_violations,
            invariant_violations: self.metrics.invariant_violations().to_vec(),
            safety_violations,
            final_time_ns,
            events_processed: self.metrics.events_processed(),
            timers_fired: self.timers.fired_count(),
            commit_fingerprint: RunReport::fingerprint(completed),
        };

        info!(
            seed = report.seed,
            outcome = report.outcome.label(),
            stop = stop.describe(),
            completed = report.requests_completed,
            issued = report.requests_issued,
            view_changes = report.view_changes,
            dropped = report.links.dropped,
            "simulation finished"
        );
        report
    }

    /// Highest sequence each honest replica has executed.
    pub fn executed_points(&self) -> BTreeMap<ReplicaId, SeqNumber> {
        self.replicas
            .iter()
            .flatten()
            .filter(|r| self.behavior(r.replica_id()).is_honest())
            .map(|r| (r.replica_id(), r.last_executed()))
            .collect()
    }

    /// Replicas the link policy cuts off completely.
    pub fn isolated(&self) -> &BTreeSet<ReplicaId> {
        self.partition.isolated()
    }
}
