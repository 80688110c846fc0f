//! Link model: Bernoulli drops and delays on directed links.
//!
//! Every attempted delivery over a directed link `(src, dst)` draws once
//! from that link's own random stream to decide whether the message is
//! dropped, and once more for the delay if it survives. Streams are forked
//! from the run seed up front in a fixed order, so traffic on one link never
//! shifts the draws on another.
//!
//! How a link's drop probability is chosen is a [`LinkPolicy`]. Links that
//! touch the client use a separate probability.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use linkfail_config::{ConfigError, ExperimentConfig, Granularity};
use linkfail_pbft::MessageKind;
use linkfail_types::ReplicaId;
use serde::{Deserialize, Serialize};

use crate::clock::ms_to_ns;
use crate::error::ReplayError;
use crate::rng::SimRng;

/// One end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Replica(ReplicaId),
    Client,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Replica(id) => write!(f, "r{}", id.as_u8()),
            Endpoint::Client => f.write_str("client"),
        }
    }
}

// ============================================================================
// Link Policy
// ============================================================================

/// Assignment of drop probabilities to replica-to-replica links.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkPolicy {
    /// Same probability on every link.
    Uniform(f64),

    /// `matrix[src][dst]`; the diagonal is unused.
    PerLink(Vec<Vec<f64>>),

    /// One probability per replica. Symmetric links combine both
    /// endpoints, `1 - (1 - p_src)(1 - p_dst)`; asymmetric links use the
    /// sender's probability only.
    PerNode { probabilities: Vec<f64>, symmetric: bool },

    /// Probability by message kind, with a fallback for unlisted kinds.
    PerMessageType {
        probabilities: BTreeMap<MessageKind, f64>,
        default: f64,
    },
}

impl LinkPolicy {
    pub fn drop_probability(&self, src: ReplicaId, dst: ReplicaId, kind: MessageKind) -> f64 {
        match self {
            LinkPolicy::Uniform(p) => *p,
            LinkPolicy::PerLink(matrix) => matrix
                .get(src.as_usize())
                .and_then(|row| row.get(dst.as_usize()))
                .copied()
                .unwrap_or(0.0),
            LinkPolicy::PerNode {
                probabilities,
                symmetric,
            } => {
                let p_of = |r: ReplicaId| probabilities.get(r.as_usize()).copied().unwrap_or(0.0);
                if *symmetric {
                    1.0 - (1.0 - p_of(src)) * (1.0 - p_of(dst))
                } else {
                    p_of(src)
                }
            }
            LinkPolicy::PerMessageType {
                probabilities,
                default,
            } => probabilities.get(&kind).copied().unwrap_or(*default),
        }
    }

    /// Every link touching `isolated` drops everything; the rest use `base`.
    pub fn isolating(size: usize, isolated: ReplicaId, base: f64) -> Self {
        let matrix = (0..size)
            .map(|src| {
                (0..size)
                    .map(|dst| {
                        if src == isolated.as_usize() || dst == isolated.as_usize() {
                            1.0
                        } else {
                            base
                        }
                    })
                    .collect()
            })
            .collect();
        LinkPolicy::PerLink(matrix)
    }

    /// Replicas whose links to and from every other replica drop all
    /// message kinds.
    pub fn isolated_replicas(&self, size: usize) -> BTreeSet<ReplicaId> {
        ReplicaId::all(size)
            .filter(|r| {
                ReplicaId::all(size).filter(|o| o != r).all(|o| {
                    MessageKind::ALL.iter().all(|kind| {
                        self.drop_probability(*r, o, *kind) >= 1.0
                            && self.drop_probability(o, *r, *kind) >= 1.0
                    })
                })
            })
            .collect()
    }

    /// Builds the policy described by the network section.
    pub fn from_config(config: &ExperimentConfig) -> Result<Self, ConfigError> {
        let network = &config.network;
        Ok(match network.granularity {
            Granularity::Uniform => LinkPolicy::Uniform(network.drop_probability),
            Granularity::PerLink => {
                let mut matrix = network.matrix.clone();
                if network.symmetric {
                    mirror_upper_triangle(&mut matrix);
                }
                LinkPolicy::PerLink(matrix)
            }
            Granularity::PerNode => LinkPolicy::PerNode {
                probabilities: network.node_probabilities.clone(),
                symmetric: network.symmetric,
            },
            Granularity::PerMessageType => LinkPolicy::PerMessageType {
                probabilities: config.message_probabilities()?,
                default: network.drop_probability,
            },
        })
    }

    /// Average drop probability over replica links, for report labels.
    pub fn mean_probability(&self, size: usize) -> f64 {
        let mut total = 0.0;
        let mut links = 0usize;
        for src in ReplicaId::all(size) {
            for dst in ReplicaId::all(size).filter(|d| *d != src) {
                total += self.drop_probability(src, dst, MessageKind::Prepare);
                links += 1;
            }
        }
        if links == 0 { 0.0 } else { total / links as f64 }
    }
}

/// Copies the upper triangle onto the lower one.
fn mirror_upper_triangle(matrix: &mut [Vec<f64>]) {
    for i in 0..matrix.len() {
        for j in 0..i {
            let upper = matrix.get(j).and_then(|row| row.get(i)).copied();
            if let (Some(value), Some(cell)) = (upper, matrix[i].get_mut(j)) {
                *cell = value;
            }
        }
    }
}

// ============================================================================
// Link Decisions
// ============================================================================

/// Outcome of one attempted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkDecision {
    Deliver { delay_ns: u64 },
    Drop,
}

impl LinkDecision {
    pub fn is_delivered(&self) -> bool {
        matches!(self, LinkDecision::Deliver { .. })
    }
}

/// Source of link decisions: the live model, or a recorded schedule.
pub trait LinkOracle {
    fn decide(
        &mut self,
        message_id: u64,
        src: Endpoint,
        dst: Endpoint,
        kind: MessageKind,
    ) -> Result<LinkDecision, ReplayError>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// Link Model
// ============================================================================

/// Bernoulli link model with per-link random streams.
#[derive(Debug, Clone)]
pub struct LinkModel {
    policy: LinkPolicy,
    client_drop_probability: f64,
    delay_min_ns: u64,
    delay_max_ns: u64,
    streams: BTreeMap<(Endpoint, Endpoint), SimRng>,
}

impl LinkModel {
    /// Forks one stream per directed link, client links included, from
    /// `rng` in a fixed order.
    pub fn new(
        size: usize,
        policy: LinkPolicy,
        client_drop_probability: f64,
        delay_min_ns: u64,
        delay_max_ns: u64,
        rng: &mut SimRng,
    ) -> Self {
        let endpoints: Vec<Endpoint> = ReplicaId::all(size)
            .map(Endpoint::Replica)
            .chain(std::iter::once(Endpoint::Client))
            .collect();

        let mut streams = BTreeMap::new();
        for src in &endpoints {
            for dst in &endpoints {
                if src != dst {
                    streams.insert((*src, *dst), rng.fork());
                }
            }
        }

        Self {
            policy,
            client_drop_probability,
            delay_min_ns,
            delay_max_ns,
            streams,
        }
    }

    pub fn from_config(config: &ExperimentConfig, rng: &mut SimRng) -> Result<Self, ConfigError> {
        let network = &config.network;
        Ok(Self::new(
            config.cluster.nodes,
            LinkPolicy::from_config(config)?,
            network.client_drop_probability,
            ms_to_ns(network.delay_min_ms),
            ms_to_ns(network.delay_max_ms),
            rng,
        ))
    }

    pub fn policy(&self) -> &LinkPolicy {
        &self.policy
    }

    pub fn drop_probability(&self, src: Endpoint, dst: Endpoint, kind: MessageKind) -> f64 {
        match (src, dst) {
            (Endpoint::Replica(src), Endpoint::Replica(dst)) => {
                self.policy.drop_probability(src, dst, kind)
            }
            _ => self.client_drop_probability,
        }
    }

    /// One Bernoulli draw from `rng` for the link `(src, dst)`.
    pub fn should_deliver(
        &self,
        src: Endpoint,
        dst: Endpoint,
        kind: MessageKind,
        rng: &mut SimRng,
    ) -> bool {
        !rng.next_bool_with_probability(self.drop_probability(src, dst, kind))
    }

    /// Delay uniform in `[min, max)`, or exactly `min` when they are equal.
    pub fn sample_delay(&self, rng: &mut SimRng) -> u64 {
        rng.next_u64_range(self.delay_min_ns, self.delay_max_ns)
    }

    /// Draws the drop, then the delay for a survivor, from the link's own
    /// stream.
    fn decide_with_stream(&mut self, src: Endpoint, dst: Endpoint, kind: MessageKind) -> LinkDecision {
        let Some(mut rng) = self.streams.remove(&(src, dst)) else {
            return LinkDecision::Deliver {
                delay_ns: self.delay_min_ns,
            };
        };
        let decision = if self.should_deliver(src, dst, kind, &mut rng) {
            LinkDecision::Deliver {
                delay_ns: self.sample_delay(&mut rng),
            }
        } else {
            LinkDecision::Drop
        };
        self.streams.insert((src, dst), rng);
        decision
    }
}

impl LinkOracle for LinkModel {
    fn decide(
        &mut self,
        _message_id: u64,
        src: Endpoint,
        dst: Endpoint,
        kind: MessageKind,
    ) -> Result<LinkDecision, ReplayError> {
        Ok(self.decide_with_stream(src, dst, kind))
    }

    fn name(&self) -> &'static str {
        "bernoulli"
    }
}

// ============================================================================
// Link Statistics
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounters {
    pub attempted: u64,
    pub dropped: u64,
    pub delivered: u64,
}

impl LinkCounters {
    fn record(&mut self, decision: LinkDecision) {
        self.attempted += 1;
        match decision {
            LinkDecision::Deliver { .. } => self.delivered += 1,
            LinkDecision::Drop => self.dropped += 1,
        }
    }

    pub fn drop_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.dropped as f64 / self.attempted as f64
        }
    }
}

/// Counts of every link decision, overall and per directed link.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    total: LinkCounters,
    per_link: BTreeMap<(Endpoint, Endpoint), LinkCounters>,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, src: Endpoint, dst: Endpoint, decision: LinkDecision) {
        self.total.record(decision);
        self.per_link.entry((src, dst)).or_default().record(decision);
    }

    pub fn total(&self) -> LinkCounters {
        self.total
    }

    pub fn link(&self, src: Endpoint, dst: Endpoint) -> LinkCounters {
        self.per_link.get(&(src, dst)).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Endpoint, Endpoint, LinkCounters)> + '_ {
        self.per_link.iter().map(|((s, d), c)| (*s, *d, *c))
    }
}
