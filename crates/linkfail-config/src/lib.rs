//! Experiment configuration for linkfail
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI overrides (highest precedence)
//! 2. Environment variables (LINKFAIL_* prefix, `__` between sections)
//! 3. Config file (TOML, or INI with the legacy root-level keys)
//! 4. Built-in defaults (lowest precedence)
//!
//! Validation runs once, before any simulation is built, so a bad
//! configuration never reaches the event loop.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use linkfail_pbft::{ByzantineBehavior, ClusterConfig, MessageKind, ReplicaConfig};
use linkfail_types::ReplicaId;
use serde::{Deserialize, Serialize};

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Complete description of one experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub cluster: ClusterSection,
    pub protocol: ProtocolSection,
    pub network: NetworkSection,
    pub workload: WorkloadSection,
    pub run: RunSection,
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Number of replicas `N`.
    pub nodes: usize,
    /// Tolerated faults `f`; derived from `nodes` when absent.
    pub faults: Option<usize>,
    /// Replicas that misbehave, as `id=behaviour` entries.
    pub byzantine: Vec<ByzantineAssignment>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            nodes: 4,
            faults: None,
            byzantine: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    pub checkpoint_interval: u64,
    pub watermark_window: u64,
    pub view_change_timeout_ms: u64,
    pub max_backoff_exponent: u32,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            checkpoint_interval: ReplicaConfig::DEFAULT_CHECKPOINT_INTERVAL,
            watermark_window: ReplicaConfig::DEFAULT_WATERMARK_WINDOW,
            view_change_timeout_ms: ReplicaConfig::DEFAULT_VIEW_CHANGE_TIMEOUT_NS / 1_000_000,
            max_backoff_exponent: ReplicaConfig::DEFAULT_MAX_BACKOFF_EXPONENT,
        }
    }
}

/// How drop probabilities are assigned to directed links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One probability for every replica link.
    #[default]
    Uniform,
    /// An explicit `N x N` matrix indexed `[src][dst]`.
    PerLink,
    /// One probability per replica.
    PerNode,
    /// One probability per protocol message kind.
    PerMessageType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub granularity: Granularity,
    /// Drop probability for `uniform`, and the fallback for message kinds
    /// missing from `message_probabilities`.
    pub drop_probability: f64,
    pub matrix: Vec<Vec<f64>>,
    pub node_probabilities: Vec<f64>,
    /// Keyed by message kind name (`pre_prepare`, `prepare`, ...).
    pub message_probabilities: BTreeMap<String, f64>,
    /// Mirror the matrix across the diagonal, or combine both endpoints'
    /// probabilities for `per_node`.
    pub symmetric: bool,
    /// Drop probability on driver to replica links and back.
    pub client_drop_probability: f64,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Fixed processing time a replica adds to every send.
    pub processing_delay_ms: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            granularity: Granularity::Uniform,
            drop_probability: 0.0,
            matrix: Vec::new(),
            node_probabilities: Vec::new(),
            message_probabilities: BTreeMap::new(),
            symmetric: false,
            client_drop_probability: 0.0,
            delay_min_ms: 1,
            delay_max_ms: 10,
            processing_delay_ms: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSection {
    /// Requests to complete; zero means run for `duration_ms`.
    pub requests: u64,
    /// Simulated time to keep issuing requests when `requests` is zero.
    pub duration_ms: u64,
    /// Maximum outstanding requests.
    pub window: usize,
    /// Gap between consecutive request issues.
    pub request_interval_ms: u64,
    /// Time without a reply quorum before the client re-broadcasts.
    pub client_timeout_ms: u64,
}

impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            requests: 100,
            duration_ms: 0,
            window: 1,
            request_interval_ms: 10,
            client_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub seed: u64,
    /// Hard simulated-time limit; reaching it means the run did not converge.
    pub horizon_ms: u64,
    /// Hard limit on processed events.
    pub max_events: u64,
    /// Stop at the first invariant violation instead of counting it.
    pub strict: bool,
    /// Directory for result logs; no log is written when absent.
    pub output_dir: Option<PathBuf>,
    /// Prefix result log names with a UTC timestamp.
    pub timestamped: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            seed: 42,
            horizon_ms: 600_000,
            max_events: 10_000_000,
            strict: false,
            output_dir: None,
            timestamped: false,
        }
    }
}

// ============================================================================
// Byzantine Assignment
// ============================================================================

/// A replica and the behaviour it runs with, written `id=behaviour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByzantineAssignment {
    pub replica: ReplicaId,
    pub behavior: ByzantineBehavior,
}

impl FromStr for ByzantineAssignment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, behavior) = s.split_once('=').ok_or_else(|| {
            ConfigError::ValidationError(format!("byzantine entry '{s}' is not id=behaviour"))
        })?;
        let replica = id.trim().parse::<u8>().map_err(|_| {
            ConfigError::ValidationError(format!("byzantine replica id '{id}' is not a number"))
        })?;
        let behavior = behavior
            .parse::<ByzantineBehavior>()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(Self {
            replica: ReplicaId::new(replica),
            behavior,
        })
    }
}

impl TryFrom<String> for ByzantineAssignment {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ByzantineAssignment> for String {
    fn from(value: ByzantineAssignment) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ByzantineAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.replica.as_u8(), self.behavior)
    }
}

// ============================================================================
// Derived Values and Validation
// ============================================================================

impl ExperimentConfig {
    /// Shape of the cluster.
    pub fn cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        let cluster = match self.cluster.faults {
            Some(faults) => ClusterConfig::with_faults(self.cluster.nodes, faults),
            None => ClusterConfig::new(self.cluster.nodes),
        };
        cluster.map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Protocol tunables for every replica.
    pub fn replica_config(&self) -> Result<ReplicaConfig, ConfigError> {
        let mut config = ReplicaConfig::new(self.cluster_config()?)
            .with_checkpoint_interval(self.protocol.checkpoint_interval)
            .with_watermark_window(self.protocol.watermark_window)
            .with_view_change_timeout_ns(self.protocol.view_change_timeout_ms.saturating_mul(1_000_000));
        config.max_backoff_exponent = self.protocol.max_backoff_exponent;
        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }

    /// Behaviour per replica; unlisted replicas are honest.
    pub fn behaviors(&self) -> BTreeMap<ReplicaId, ByzantineBehavior> {
        self.cluster
            .byzantine
            .iter()
            .map(|a| (a.replica, a.behavior))
            .collect()
    }

    /// Per-message-kind probabilities with the names resolved.
    pub fn message_probabilities(&self) -> Result<BTreeMap<MessageKind, f64>, ConfigError> {
        self.network
            .message_probabilities
            .iter()
            .map(|(name, p)| {
                MessageKind::from_config_name(name)
                    .map(|kind| (kind, *p))
                    .ok_or_else(|| {
                        ConfigError::ValidationError(format!("unknown message kind '{name}'"))
                    })
            })
            .collect()
    }

    /// Checks every section, failing on the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cluster = self.replica_config()?.cluster;
        let n = cluster.size();

        self.validate_network(n)?;

        let workload = &self.workload;
        if workload.requests == 0 && workload.duration_ms == 0 {
            return Err(invalid("workload needs a request count or a duration"));
        }
        if workload.window == 0 {
            return Err(invalid("workload.window must be at least 1"));
        }
        if workload.client_timeout_ms == 0 {
            return Err(invalid("workload.client_timeout_ms must be greater than zero"));
        }
        if self.run.horizon_ms == 0 {
            return Err(invalid("run.horizon_ms must be greater than zero"));
        }

        let mut seen = BTreeSet::new();
        for assignment in &self.cluster.byzantine {
            if !cluster.contains(assignment.replica) {
                return Err(invalid(format!(
                    "byzantine replica {} is outside a cluster of {n}",
                    assignment.replica
                )));
            }
            if !seen.insert(assignment.replica) {
                return Err(invalid(format!(
                    "byzantine replica {} is listed twice",
                    assignment.replica
                )));
            }
        }
        let faulty = self
            .cluster
            .byzantine
            .iter()
            .filter(|a| !a.behavior.is_honest())
            .count();
        if faulty > cluster.faults() {
            return Err(invalid(format!(
                "{faulty} byzantine replicas exceed f = {}",
                cluster.faults()
            )));
        }

        Ok(())
    }

    fn validate_network(&self, n: usize) -> Result<(), ConfigError> {
        let network = &self.network;
        check_probability("network.drop_probability", network.drop_probability)?;
        check_probability("network.client_drop_probability", network.client_drop_probability)?;

        match network.granularity {
            Granularity::Uniform => {}
            Granularity::PerLink => {
                if network.matrix.len() != n || network.matrix.iter().any(|row| row.len() != n) {
                    return Err(invalid(format!("network.matrix must be {n}x{n}")));
                }
                for row in &network.matrix {
                    for p in row {
                        check_probability("network.matrix entry", *p)?;
                    }
                }
            }
            Granularity::PerNode => {
                if network.node_probabilities.len() != n {
                    return Err(invalid(format!(
                        "network.node_probabilities needs {n} entries, got {}",
                        network.node_probabilities.len()
                    )));
                }
                for p in &network.node_probabilities {
                    check_probability("network.node_probabilities entry", *p)?;
                }
            }
            Granularity::PerMessageType => {
                for (kind, p) in self.message_probabilities()? {
                    check_probability(kind.name(), p)?;
                }
            }
        }

        if network.delay_min_ms > network.delay_max_ms {
            return Err(invalid(format!(
                "network.delay_min_ms ({}) exceeds delay_max_ms ({})",
                network.delay_min_ms, network.delay_max_ms
            )));
        }
        Ok(())
    }

    /// Short label for logs and result file names.
    pub fn run_identity(&self) -> String {
        format!(
            "n={} p={} requests={} seed={}",
            self.cluster.nodes, self.network.drop_probability, self.workload.requests, self.run.seed
        )
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn check_probability(what: &str, p: f64) -> Result<(), ConfigError> {
    if p.is_nan() || !(0.0..=1.0).contains(&p) {
        return Err(invalid(format!("{what} must be within [0, 1], got {p}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn base() -> ExperimentConfig {
        ExperimentConfig::default()
    }

    #[test]
    fn defaults_are_valid() {
        base().validate().expect("defaults validate");
    }

    #[test_case(|c: &mut ExperimentConfig| c.cluster.nodes = 3; "too few nodes")]
    #[test_case(|c: &mut ExperimentConfig| c.cluster.nodes = 5; "not three f plus one")]
    #[test_case(|c: &mut ExperimentConfig| c.cluster.faults = Some(2); "faults disagree with nodes")]
    #[test_case(|c: &mut ExperimentConfig| c.network.drop_probability = 1.5; "probability above one")]
    #[test_case(|c: &mut ExperimentConfig| c.network.drop_probability = f64::NAN; "probability nan")]
    #[test_case(|c: &mut ExperimentConfig| c.network.client_drop_probability = -0.1; "negative client probability")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.network.granularity = Granularity::PerLink;
        c.network.matrix = vec![vec![0.0; 4]; 3];
    }; "matrix wrong shape")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.network.granularity = Granularity::PerNode;
        c.network.node_probabilities = vec![0.1; 2];
    }; "node probabilities wrong length")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.network.granularity = Granularity::PerMessageType;
        c.network.message_probabilities.insert("gossip".into(), 0.1);
    }; "unknown message kind")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.network.delay_min_ms = 20;
        c.network.delay_max_ms = 10;
    }; "inverted delay bounds")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.workload.requests = 0;
        c.workload.duration_ms = 0;
    }; "no horizon for the workload")]
    #[test_case(|c: &mut ExperimentConfig| c.workload.window = 0; "zero window")]
    #[test_case(|c: &mut ExperimentConfig| c.protocol.view_change_timeout_ms = 0; "zero view change timeout")]
    #[test_case(|c: &mut ExperimentConfig| c.workload.client_timeout_ms = 0; "zero client timeout")]
    #[test_case(|c: &mut ExperimentConfig| c.protocol.checkpoint_interval = 0; "zero checkpoint interval")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.protocol.checkpoint_interval = 512;
        c.protocol.watermark_window = 256;
    }; "checkpoint beyond window")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.cluster.byzantine = vec!["7=silent".parse().expect("entry")];
    }; "byzantine id outside cluster")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.cluster.byzantine = vec!["1=silent".parse().expect("entry"), "1=equivocate".parse().expect("entry")];
    }; "byzantine id twice")]
    #[test_case(|c: &mut ExperimentConfig| {
        c.cluster.byzantine = vec!["1=silent".parse().expect("entry"), "2=equivocate".parse().expect("entry")];
    }; "more byzantine than f")]
    fn rejects_invalid(mutate: fn(&mut ExperimentConfig)) {
        let mut config = base();
        mutate(&mut config);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn accepts_per_link_matrix() {
        let mut config = base();
        config.network.granularity = Granularity::PerLink;
        config.network.matrix = vec![vec![0.2; 4]; 4];
        config.validate().expect("valid matrix");
    }

    #[test]
    fn byzantine_assignment_parses_and_displays() {
        let assignment: ByzantineAssignment = "3=delay:25".parse().expect("entry");
        assert_eq!(assignment.replica, ReplicaId::new(3));
        assert_eq!(assignment.behavior, ByzantineBehavior::Delay { ms: 25 });
        assert_eq!(assignment.to_string(), "3=delay:25");
        assert!("three=silent".parse::<ByzantineAssignment>().is_err());
        assert!("3".parse::<ByzantineAssignment>().is_err());
    }

    #[test]
    fn replica_config_carries_protocol_section() {
        let mut config = base();
        config.cluster.nodes = 7;
        config.protocol.view_change_timeout_ms = 250;
        let replica = config.replica_config().expect("valid");
        assert_eq!(replica.cluster.faults(), 2);
        assert_eq!(replica.view_change_timeout_ns, 250_000_000);
    }

    #[test]
    fn behaviors_default_to_honest() {
        let mut config = base();
        config.cluster.byzantine = vec!["2=equivocate".parse().expect("entry")];
        let behaviors = config.behaviors();
        assert_eq!(behaviors.get(&ReplicaId::new(2)), Some(&ByzantineBehavior::Equivocate));
        assert_eq!(behaviors.get(&ReplicaId::new(0)), None);
    }

    #[test]
    fn toml_round_trip_keeps_byzantine_entries() {
        let mut config = base();
        config.cluster.byzantine = vec!["1=silent".parse().expect("entry")];
        let text = toml::to_string(&config).expect("serialize");
        assert!(text.contains("\"1=silent\""));
        let back: ExperimentConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(back, config);
    }
}
