//! Deterministic event logging for simulation runs.
//!
//! Records every link decision (the only source of randomness in a run)
//! plus the protocol milestones a reader needs to follow it: timer fires,
//! view changes, commits, state transfers and client completions.
//!
//! ## Format
//!
//! The on-disk log is a sequence of postcard values: format version, run
//! seed, event count, then the events. Identical runs produce identical
//! bytes.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use linkfail_pbft::{MessageKind, TimeoutKind};
use linkfail_types::{Digest, ReplicaId, RequestId, SeqNumber, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::network::{Endpoint, LinkDecision};

/// Bumped whenever [`Decision`] changes shape.
pub const EVENT_LOG_VERSION: u32 = 1;

// ============================================================================
// Logged Events
// ============================================================================

/// A logged decision or milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Simulation time when this was recorded.
    pub time_ns: u64,

    /// Sequential position in the log.
    pub event_id: u64,

    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// A send survived its link.
    LinkDeliver {
        message_id: u64,
        src: Endpoint,
        dst: Endpoint,
        kind: MessageKind,
        delay_ns: u64,
    },

    /// A send was dropped by its link.
    LinkDrop {
        message_id: u64,
        src: Endpoint,
        dst: Endpoint,
        kind: MessageKind,
    },

    TimerFired {
        replica: ReplicaId,
        kind: TimeoutKind,
        view: ViewNumber,
    },

    ViewChangeStarted {
        replica: ReplicaId,
        view: ViewNumber,
    },

    ViewInstalled {
        replica: ReplicaId,
        view: ViewNumber,
    },

    Committed {
        replica: ReplicaId,
        seq: SeqNumber,
        view: ViewNumber,
        request_id: RequestId,
        digest: Digest,
    },

    StateTransferred {
        replica: ReplicaId,
        seq: SeqNumber,
    },

    /// The client sent a request; `to` is `None` for a retry broadcast.
    RequestIssued {
        request_id: RequestId,
        to: Option<ReplicaId>,
    },

    /// The client collected a reply quorum.
    RequestCompleted {
        request_id: RequestId,
        seq: SeqNumber,
        view: ViewNumber,
        latency_ns: u64,
    },
}

/// One link decision, as the replayer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStep {
    pub message_id: u64,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub kind: MessageKind,
    pub decision: LinkDecision,
}

impl LinkStep {
    /// Same send, regardless of what was decided for it.
    pub fn same_send(&self, other: &LinkStep) -> bool {
        self.message_id == other.message_id
            && self.src == other.src
            && self.dst == other.dst
            && self.kind == other.kind
    }
}

impl std::fmt::Display for LinkStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} {}->{}",
            self.message_id, self.kind, self.src, self.dst
        )
    }
}

impl Decision {
    pub fn link(message_id: u64, src: Endpoint, dst: Endpoint, kind: MessageKind, decision: LinkDecision) -> Self {
        match decision {
            LinkDecision::Deliver { delay_ns } => Decision::LinkDeliver {
                message_id,
                src,
                dst,
                kind,
                delay_ns,
            },
            LinkDecision::Drop => Decision::LinkDrop {
                message_id,
                src,
                dst,
                kind,
            },
        }
    }

    /// The link step this records, if it is a link decision.
    pub fn as_link_step(&self) -> Option<LinkStep> {
        match *self {
            Decision::LinkDeliver {
                message_id,
                src,
                dst,
                kind,
                delay_ns,
            } => Some(LinkStep {
                message_id,
                src,
                dst,
                kind,
                decision: LinkDecision::Deliver { delay_ns },
            }),
            Decision::LinkDrop {
                message_id,
                src,
                dst,
                kind,
            } => Some(LinkStep {
                message_id,
                src,
                dst,
                kind,
                decision: LinkDecision::Drop,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Event Log
// ============================================================================

/// Event logger that records simulation decisions.
#[derive(Debug)]
pub struct EventLog {
    seed: u64,
    events: Vec<LoggedEvent>,
    enabled: bool,
}

impl EventLog {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            events: Vec::new(),
            enabled: true,
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self {
            seed: 0,
            events: Vec::new(),
            enabled: false,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log(&mut self, time_ns: u64, decision: Decision) {
        if !self.enabled {
            return;
        }
        let event_id = self.events.len() as u64;
        self.events.push(LoggedEvent {
            time_ns,
            event_id,
            decision,
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoggedEvent> {
        self.events.iter()
    }

    /// Link decisions in the order they were made.
    pub fn link_steps(&self) -> impl Iterator<Item = LinkStep> + '_ {
        self.events.iter().filter_map(|e| e.decision.as_link_step())
    }

    pub fn summary(&self) -> EventLogSummary {
        let mut summary = EventLogSummary::default();
        for event in &self.events {
            summary.total_events += 1;
            match &event.decision {
                Decision::LinkDeliver { .. } => summary.delivered += 1,
                Decision::LinkDrop { .. } => summary.dropped += 1,
                Decision::TimerFired { .. } => summary.timers_fired += 1,
                Decision::ViewChangeStarted { .. } | Decision::ViewInstalled { .. } => {
                    summary.view_events += 1;
                }
                Decision::Committed { .. } => summary.commits += 1,
                Decision::StateTransferred { .. } => summary.state_transfers += 1,
                Decision::RequestIssued { .. } | Decision::RequestCompleted { .. } => {
                    summary.client_events += 1;
                }
            }
        }
        summary
    }

    /// Encodes the log: version, seed, count, events.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut bytes = postcard::to_allocvec(&EVENT_LOG_VERSION).map_err(io::Error::other)?;
        bytes.extend(postcard::to_allocvec(&self.seed).map_err(io::Error::other)?);
        bytes.extend(postcard::to_allocvec(&(self.events.len() as u64)).map_err(io::Error::other)?);
        for event in &self.events {
            bytes.extend(postcard::to_allocvec(event).map_err(io::Error::other)?);
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let (version, rest): (u32, _) = postcard::take_from_bytes(bytes).map_err(invalid_data)?;
        if version != EVENT_LOG_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported event log version {version}, expected {EVENT_LOG_VERSION}"),
            ));
        }
        let (seed, rest): (u64, _) = postcard::take_from_bytes(rest).map_err(invalid_data)?;
        let (count, mut rest): (u64, _) = postcard::take_from_bytes(rest).map_err(invalid_data)?;

        let mut events = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            let (event, tail): (LoggedEvent, _) = postcard::take_from_bytes(rest).map_err(invalid_data)?;
            events.push(event);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after {count} events", rest.len()),
            ));
        }

        Ok(Self {
            seed,
            events,
            enabled: true,
        })
    }

    /// Writes the log to a file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

fn invalid_data(error: postcard::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

/// Counts per decision family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogSummary {
    pub total_events: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub timers_fired: usize,
    pub view_events: usize,
    pub commits: usize,
    pub state_transfers: usize,
    pub client_events: usize,
}
