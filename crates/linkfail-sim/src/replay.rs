//! Schedule replay: answer link decisions from a recorded event log.
//!
//! The replica state machines, timers and driver are deterministic, so a
//! run is fully determined by its link decisions. Feeding the recorded
//! decisions back in, position by position, reproduces the run without
//! touching the RNG, even under a different seed.
//!
//! ```ignore
//! let log = EventLog::load_from_file("run.events")?;
//! let replayer = ScheduleReplayer::from_event_log(&log);
//! let report = Simulation::with_oracle(config, Box::new(replayer))?.run()?;
//! ```

use std::io;
use std::path::Path;

use linkfail_pbft::MessageKind;

use crate::error::ReplayError;
use crate::event_log::{EventLog, LinkStep};
use crate::network::{Endpoint, LinkDecision, LinkOracle};

/// Replays the link decisions of a recorded run.
#[derive(Debug, Clone)]
pub struct ScheduleReplayer {
    steps: Vec<LinkStep>,
    position: usize,
}

impl ScheduleReplayer {
    pub fn new(steps: Vec<LinkStep>) -> Self {
        Self { steps, position: 0 }
    }

    pub fn from_event_log(log: &EventLog) -> Self {
        Self::new(log.link_steps().collect())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::from_event_log(&EventLog::load_from_file(path)?))
    }

    pub fn total(&self) -> usize {
        self.steps.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// True once every recorded decision has been consumed.
    pub fn is_complete(&self) -> bool {
        self.position >= self.steps.len()
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }
}

impl LinkOracle for ScheduleReplayer {
    fn decide(
        &mut self,
        message_id: u64,
        src: Endpoint,
        dst: Endpoint,
        kind: MessageKind,
    ) -> Result<LinkDecision, ReplayError> {
        let Some(expected) = self.steps.get(self.position) else {
            return Err(ReplayError::Exhausted {
                decisions: self.steps.len(),
            });
        };

        let actual = LinkStep {
            message_id,
            src,
            dst,
            kind,
            decision: expected.decision,
        };
        if !expected.same_send(&actual) {
            return Err(ReplayError::Divergence {
                position: self.position,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        self.position += 1;
        Ok(expected.decision)
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::Decision;
    use linkfail_types::ReplicaId;

    fn r(id: u8) -> Endpoint {
        Endpoint::Replica(ReplicaId::new(id))
    }

    fn recorded() -> EventLog {
        let mut log = EventLog::new(1);
        log.log(0, Decision::link(0, r(0), r(1), MessageKind::Prepare, LinkDecision::Drop));
        log.log(0, Decision::StateTransferred {
            replica: ReplicaId::new(2),
            seq: linkfail_types::SeqNumber::new(8),
        });
        log.log(
            10,
            Decision::link(1, r(1), r(0), MessageKind::Commit, LinkDecision::Deliver { delay_ns: 7 }),
        );
        log
    }

    #[test]
    fn replays_recorded_decisions_in_order() {
        let mut replayer = ScheduleReplayer::from_event_log(&recorded());
        assert_eq!(replayer.total(), 2);

        assert_eq!(replayer.decide(0, r(0), r(1), MessageKind::Prepare), Ok(LinkDecision::Drop));
        assert_eq!(
            replayer.decide(1, r(1), r(0), MessageKind::Commit),
            Ok(LinkDecision::Deliver { delay_ns: 7 })
        );
        assert!(replayer.is_complete());
        assert_eq!(
            replayer.decide(2, r(0), r(1), MessageKind::Commit),
            Err(ReplayError::Exhausted { decisions: 2 })
        );
    }

    #[test]
    fn mismatched_send_is_a_divergence() {
        let mut replayer = ScheduleReplayer::from_event_log(&recorded());
        let result = replayer.decide(0, r(0), r(2), MessageKind::Prepare);
        assert!(matches!(result, Err(ReplayError::Divergence { position: 0, .. })));
        assert_eq!(replayer.position(), 0);

        replayer.reset();
        assert!(replayer.decide(0, r(0), r(1), MessageKind::Prepare).is_ok());
    }
}
