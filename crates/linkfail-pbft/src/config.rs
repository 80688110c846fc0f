//! Cluster and replica configuration.

use linkfail_types::{ReplicaId, ViewNumber};
use serde::{Deserialize, Serialize};

/// Errors produced when a cluster shape is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster needs at least 4 replicas to tolerate one fault, got {0}")]
    TooSmall(usize),

    #[error("cluster of {0} replicas exceeds the maximum of {max}", max = ReplicaId::MAX_REPLICAS)]
    TooLarge(usize),

    #[error("cluster size {size} does not equal 3f+1 for f = {faults}")]
    Inconsistent { size: usize, faults: usize },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("checkpoint interval {interval} exceeds the watermark window {window}")]
    CheckpointBeyondWindow { interval: u64, window: u64 },
}

// ============================================================================
// Cluster Configuration
// ============================================================================

/// Static membership of an `N = 3f + 1` cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    size: usize,
    faults: usize,
}

impl ClusterConfig {
    /// Creates a cluster of `size` replicas, deriving `f = (size - 1) / 3`.
    ///
    /// `size` must be exactly `3f + 1`.
    pub fn new(size: usize) -> Result<Self, ClusterError> {
        let faults = size.saturating_sub(1) / 3;
        Self::with_faults(size, faults)
    }

    /// Creates a cluster with an explicit fault threshold.
    pub fn with_faults(size: usize, faults: usize) -> Result<Self, ClusterError> {
        if size < 4 {
            return Err(ClusterError::TooSmall(size));
        }
        if size > ReplicaId::MAX_REPLICAS {
            return Err(ClusterError::TooLarge(size));
        }
        if size != 3 * faults + 1 {
            return Err(ClusterError::Inconsistent { size, faults });
        }
        Ok(Self { size, faults })
    }

    /// Number of replicas `N`.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tolerated Byzantine faults `f`.
    pub fn faults(&self) -> usize {
        self.faults
    }

    /// Certificate size `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.faults + 1
    }

    /// Smallest set guaranteed to contain one correct replica, `f + 1`.
    pub fn weak_quorum(&self) -> usize {
        self.faults + 1
    }

    /// Primary of `view`: replica `view mod N`.
    pub fn primary(&self, view: ViewNumber) -> ReplicaId {
        ReplicaId::new((view.as_u64() % self.size as u64) as u8)
    }

    pub fn contains(&self, replica: ReplicaId) -> bool {
        replica.as_usize() < self.size
    }

    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> {
        ReplicaId::all(self.size)
    }
}

// ============================================================================
// Replica Configuration
// ============================================================================

/// Protocol tunables shared by every replica of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub cluster: ClusterConfig,
    /// Executed sequences between checkpoints.
    pub checkpoint_interval: u64,
    /// Width of the `(low, high]` watermark window.
    pub watermark_window: u64,
    /// Base view-change timeout in nanoseconds of simulated time.
    pub view_change_timeout_ns: u64,
    /// Upper bound on the exponent of the view-change backoff.
    pub max_backoff_exponent: u32,
}

impl ReplicaConfig {
    pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 16;
    pub const DEFAULT_WATERMARK_WINDOW: u64 = 256;
    pub const DEFAULT_VIEW_CHANGE_TIMEOUT_NS: u64 = 1_000_000_000;
    pub const DEFAULT_MAX_BACKOFF_EXPONENT: u32 = 6;

    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            checkpoint_interval: Self::DEFAULT_CHECKPOINT_INTERVAL,
            watermark_window: Self::DEFAULT_WATERMARK_WINDOW,
            view_change_timeout_ns: Self::DEFAULT_VIEW_CHANGE_TIMEOUT_NS,
            max_backoff_exponent: Self::DEFAULT_MAX_BACKOFF_EXPONENT,
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_watermark_window(mut self, window: u64) -> Self {
        self.watermark_window = window;
        self
    }

    pub fn with_view_change_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.view_change_timeout_ns = timeout_ns;
        self
    }

    /// Checks the tunables against each other.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.checkpoint_interval == 0 {
            return Err(ClusterError::Zero {
                field: "checkpoint_interval",
            });
        }
        if self.watermark_window == 0 {
            return Err(ClusterError::Zero {
                field: "watermark_window",
            });
        }
        if self.view_change_timeout_ns == 0 {
            return Err(ClusterError::Zero {
                field: "view_change_timeout",
            });
        }
        if self.checkpoint_interval > self.watermark_window {
            return Err(ClusterError::CheckpointBeyondWindow {
                interval: self.checkpoint_interval,
                window: self.watermark_window,
            });
        }
        Ok(())
    }

    /// View-change timeout after `attempts` consecutive unsuccessful view
    /// changes: `base * 2^min(attempts, cap)`.
    pub fn backoff_timeout_ns(&self, attempts: u32) -> u64 {
        let exponent = attempts.min(self.max_backoff_exponent);
        self.view_change_timeout_ns.saturating_mul(1u64 << exponent)
    }

    /// Grace period before a replica that fell behind a proven checkpoint
    /// asks for a snapshot.
    pub fn state_transfer_timeout_ns(&self) -> u64 {
        (self.view_change_timeout_ns / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(4, 1, 3; "four replicas")]
    #[test_case(7, 2, 5; "seven replicas")]
    #[test_case(10, 3, 7; "ten replicas")]
    fn quorum_is_two_f_plus_one(size: usize, faults: usize, quorum: usize) {
        let cluster = ClusterConfig::new(size).expect("valid cluster");
        assert_eq!(cluster.faults(), faults);
        assert_eq!(cluster.quorum(), quorum);
        assert_eq!(cluster.weak_quorum(), faults + 1);
    }

    #[test_case(3; "too small")]
    #[test_case(5; "not three f plus one")]
    #[test_case(6; "also not three f plus one")]
    fn rejects_bad_sizes(size: usize) {
        assert!(ClusterConfig::new(size).is_err());
    }

    #[test]
    fn explicit_faults_must_match() {
        assert_eq!(
            ClusterConfig::with_faults(7, 1),
            Err(ClusterError::Inconsistent { size: 7, faults: 1 })
        );
        assert!(ClusterConfig::with_faults(7, 2).is_ok());
    }

    #[test]
    fn primary_rotates_with_view() {
        let cluster = ClusterConfig::new(4).expect("valid cluster");
        let primaries: Vec<u8> = (0..6)
            .map(|v| cluster.primary(ViewNumber::new(v)).as_u8())
            .collect();
        assert_eq!(primaries, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ReplicaConfig::new(ClusterConfig::new(4).expect("valid cluster"))
            .with_view_change_timeout_ns(100);
        assert_eq!(config.backoff_timeout_ns(0), 100);
        assert_eq!(config.backoff_timeout_ns(1), 200);
        assert_eq!(config.backoff_timeout_ns(3), 800);
        assert_eq!(config.backoff_timeout_ns(50), 100 << 6);
    }

    #[test]
    fn checkpoint_interval_must_fit_window() {
        let config = ReplicaConfig::new(ClusterConfig::new(4).expect("valid cluster"))
            .with_checkpoint_interval(64)
            .with_watermark_window(32);
        assert!(matches!(
            config.validate(),
            Err(ClusterError::CheckpointBeyondWindow { .. })
        ));
    }
}
