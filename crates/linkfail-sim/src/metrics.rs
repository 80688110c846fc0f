//! Run metrics and the summary record emitted at the end of a run.

use std::collections::{BTreeMap, BTreeSet};

use hdrhistogram::Histogram;
use linkfail_types::ViewNumber;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::ns_to_ms_f64;
use crate::driver::{CompletedRequest, SafetyViolation};
use crate::invariant::ViolationRecord;
use crate::network::LinkCounters;

// ============================================================================
// Latency
// ============================================================================

/// Commit latency distribution, in milliseconds of simulated time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// Summarises latencies given in nanoseconds (3 significant digits).
    ///
    /// The histogram grows to fit the largest sample.
    pub fn from_latencies(latencies_ns: &[u64]) -> Self {
        if latencies_ns.is_empty() {
            return Self::default();
        }
        let Ok(mut histogram) = Histogram::<u64>::new(3) else {
            return Self::default();
        };
        for &latency in latencies_ns {
            if let Err(error) = histogram.record(latency) {
                warn!(latency_ns = latency, error = ?error, "latency sample not recorded");
            }
        }

        Self {
            count: histogram.len(),
            min_ms: ns_to_ms_f64(histogram.min()),
            mean_ms: histogram.mean() / 1_000_000.0,
            p50_ms: ns_to_ms_f64(histogram.value_at_quantile(0.50)),
            p95_ms: ns_to_ms_f64(histogram.value_at_quantile(0.95)),
            p99_ms: ns_to_ms_f64(histogram.value_at_quantile(0.99)),
            max_ms: ns_to_ms_f64(histogram.max()),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The workload finished before any limit.
    Converged,

    /// A limit was reached with work still open.
    NonConverged { reason: String },

    /// Conflicting values were certified or committed.
    SafetyViolation { count: usize },

    /// The run was stopped from outside.
    Cancelled,
}

impl Outcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Converged => "converged",
            Outcome::NonConverged { .. } => "non-converged",
            Outcome::SafetyViolation { .. } => "safety-violation",
            Outcome::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Counters the simulation updates while it runs.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    installed_views: BTreeSet<ViewNumber>,
    view_change_attempts: u64,
    state_transfers: u64,
    events_processed: u64,
    invariant_violations: Vec<ViolationRecord>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self) {
        self.events_processed += 1;
    }

    pub fn record_view_change_started(&mut self) {
        self.view_change_attempts += 1;
    }

    pub fn record_view_installed(&mut self, view: ViewNumber) {
        self.installed_views.insert(view);
    }

    pub fn record_state_transfer(&mut self) {
        self.state_transfers += 1;
    }

    pub fn record_invariant_violation(&mut self, record: ViolationRecord) {
        self.invariant_violations.push(record);
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Distinct views above zero that some replica installed.
    pub fn view_changes(&self) -> u64 {
        self.installed_views
            .iter()
            .filter(|v| **v > ViewNumber::ZERO)
            .count() as u64
    }

    pub fn max_view(&self) -> ViewNumber {
        self.installed_views
            .iter()
            .next_back()
            .copied()
            .unwrap_or(ViewNumber::ZERO)
    }

    pub fn view_change_attempts(&self) -> u64 {
        self.view_change_attempts
    }

    pub fn state_transfers(&self) -> u64 {
        self.state_transfers
    }

    pub fn invariant_violations(&self) -> &[ViolationRecord] {
        &self.invariant_violations
    }
}

// ============================================================================
// Run Report
// ============================================================================

/// Summary record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub seed: u64,
    pub nodes: usize,
    pub faults: usize,
    /// Mean drop probability over replica links.
    pub drop_probability: f64,
    pub link_oracle: String,
    pub outcome: Outcome,

    pub requests_issued: u64,
    pub requests_completed: u64,
    pub client_retries: u64,
    pub latency: LatencyStats,
    /// Completed requests per simulated second.
    pub throughput_rps: f64,

    pub view_changes: u64,
    pub view_change_attempts: u64,
    pub max_view: u64,
    pub state_transfers: u64,

    pub links: LinkCounters,
    pub protocol_violations: BTreeMap<String, u64>,
    pub invariant_violations: Vec<ViolationRecord>,
    pub safety_violations: Vec<SafetyViolation>,

    pub final_time_ns: u64,
    pub events_processed: u64,
    pub timers_fired: u64,
    /// blake3 over the completed `(request, seq, result)` sequence.
    pub commit_fingerprint: String,
}

impl RunReport {
    /// Hex digest of the completion sequence; equal for runs that
    /// certified the same replies in the same order.
    pub fn fingerprint(completed: &[CompletedRequest]) -> String {
        let mut hasher = blake3::Hasher::new();
        for done in completed {
            hasher.update(&done.request_id.as_u64().to_le_bytes());
            hasher.update(&done.seq.as_u64().to_le_bytes());
            hasher.update(done.result.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn throughput(completed: u64, final_time_ns: u64) -> f64 {
        if final_time_ns == 0 {
            0.0
        } else {
            completed as f64 / (final_time_ns as f64 / 1_000_000_000.0)
        }
    }

    pub fn protocol_violation_total(&self) -> u64 {
        self.protocol_violations.values().sum()
    }

    pub fn has_safety_violation(&self) -> bool {
        matches!(self.outcome, Outcome::SafetyViolation { .. })
    }

    /// Compares with a report from the same seed and configuration.
    pub fn check_determinism(&self, other: &RunReport) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        if self.commit_fingerprint != other.commit_fingerprint {
            violations.push(format!(
                "commit_fingerprint: {} != {}",
                self.commit_fingerprint, other.commit_fingerprint
            ));
        }
        if self.events_processed != other.events_processed {
            violations.push(format!(
                "events_processed: {} != {}",
                self.events_processed, other.events_processed
            ));
        }
        if self.final_time_ns != other.final_time_ns {
            violations.push(format!(
                "final_time_ns: {} != {}",
                self.final_time_ns, other.final_time_ns
            ));
        }
        if self.links != other.links {
            violations.push(format!("links: {:?} != {:?}", self.links, other.links));
        }
        if self.outcome != other.outcome {
            violations.push(format!("outcome: {:?} != {:?}", self.outcome, other.outcome));
        }
        if violations.is_empty() && self != other {
            violations.push("reports differ".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
