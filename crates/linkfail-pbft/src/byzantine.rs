//! Byzantine send behaviour.
//!
//! A faulty replica runs the same state machine as everyone else; its
//! misbehaviour is applied to what it sends. The behaviour is chosen per
//! replica at configuration time.
//!
//! - **Honest**: sends exactly what the state machine produced
//! - **Equivocate**: as primary, alternating backups get PRE-PREPAREs for
//!   two different requests; as backup, half of the peers get PREPARE and
//!   COMMIT votes for a corrupted digest
//! - **Silent**: sends nothing, replies included
//! - **Delay**: every send is held back by a fixed extra latency

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::config::ClusterConfig;
use crate::message::{Message, MessagePayload, PrePrepare, Request};

const EQUIVOCATION_MARKER: &[u8] = b"#equivocation";

/// How a replica treats its outgoing traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ByzantineBehavior {
    #[default]
    Honest,
    Equivocate,
    Silent,
    Delay { ms: u64 },
}

/// A message ready for the link layer, with any extra delay the sender adds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub message: Message,
    pub extra_delay_ns: u64,
}

impl ByzantineBehavior {
    pub fn is_honest(&self) -> bool {
        matches!(self, ByzantineBehavior::Honest)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ByzantineBehavior::Honest => "honest",
            ByzantineBehavior::Equivocate => "equivocate",
            ByzantineBehavior::Silent => "silent",
            ByzantineBehavior::Delay { .. } => "delay",
        }
    }

    fn extra_delay_ns(&self) -> u64 {
        match self {
            ByzantineBehavior::Delay { ms } => ms.saturating_mul(1_000_000),
            _ => 0,
        }
    }

    /// Extra delay for a reply to the client, or `None` if the reply is
    /// suppressed.
    pub fn shape_reply(&self) -> Option<u64> {
        match self {
            ByzantineBehavior::Silent => None,
            other => Some(other.extra_delay_ns()),
        }
    }

    /// Applies the behaviour to one message produced by the state machine.
    ///
    /// Broadcasts the behaviour does not touch stay broadcasts; the caller
    /// fans them out. Rewritten messages are re-sealed with the sender's own
    /// authenticator, so they verify like anything else it sends.
    pub fn shape(
        &self,
        message: Message,
        cluster: &ClusterConfig,
        authenticator: &Authenticator,
    ) -> Vec<Outbound> {
        match self {
            ByzantineBehavior::Silent => Vec::new(),
            ByzantineBehavior::Honest | ByzantineBehavior::Delay { .. } => vec![Outbound {
                message,
                extra_delay_ns: self.extra_delay_ns(),
            }],
            ByzantineBehavior::Equivocate => equivocate(message, cluster, authenticator)
                .into_iter()
                .map(|message| Outbound {
                    message,
                    extra_delay_ns: 0,
                })
                .collect(),
        }
    }
}

fn equivocate(message: Message, cluster: &ClusterConfig, authenticator: &Authenticator) -> Vec<Message> {
    if !message.is_broadcast() {
        return vec![message];
    }
    let forged_payload = match &message.payload {
        MessagePayload::PrePrepare(pp) => MessagePayload::PrePrepare(forge_pre_prepare(pp)),
        MessagePayload::Prepare(prepare) => {
            let mut forged = *prepare;
            forged.digest = forged.digest.corrupted();
            MessagePayload::Prepare(forged)
        }
        MessagePayload::Commit(commit) => {
            let mut forged = *commit;
            forged.digest = forged.digest.corrupted();
            MessagePayload::Commit(forged)
        }
        _ => return vec![message],
    };

    cluster
        .replicas()
        .filter(|replica| *replica != message.from)
        .enumerate()
        .map(|(index, to)| {
            if index % 2 == 0 {
                message.retarget(to)
            } else {
                authenticator.seal(Message::targeted(message.from, to, forged_payload.clone()))
            }
        })
        .collect()
}

/// A PRE-PREPARE for the same slot and request id but different operation
/// bytes, internally consistent so it passes the digest check.
fn forge_pre_prepare(pp: &PrePrepare) -> PrePrepare {
    let mut operation = BytesMut::with_capacity(pp.request.operation.len() + EQUIVOCATION_MARKER.len());
    operation.put_slice(&pp.request.operation);
    operation.put_slice(EQUIVOCATION_MARKER);
    PrePrepare::new(
        pp.view,
        pp.seq,
        Request::new(pp.request.request_id, operation.freeze()),
    )
}

// ============================================================================
// Parsing
// ============================================================================

/// Error returned when a behaviour name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown byzantine behaviour '{0}' (expected honest, equivocate, silent or delay:<ms>)")]
pub struct ParseBehaviorError(String);

impl FromStr for ByzantineBehavior {
    type Err = ParseBehaviorError;

    /// Accepts `honest`, `equivocate`, `silent`, `delay:<ms>` and
    /// `delay=<ms>`, case-insensitively. A trailing `ms` is allowed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "honest" => return Ok(ByzantineBehavior::Honest),
            "equivocate" => return Ok(ByzantineBehavior::Equivocate),
            "silent" => return Ok(ByzantineBehavior::Silent),
            _ => {}
        }

        let ms = lowered
            .strip_prefix("delay")
            .map(|rest| rest.trim_start_matches([':', '=', '(']).trim_end_matches(')'))
            .map(|rest| rest.trim_end_matches("ms").trim())
            .and_then(|digits| digits.parse::<u64>().ok());
        ms.map(|ms| ByzantineBehavior::Delay { ms })
            .ok_or_else(|| ParseBehaviorError(s.to_string()))
    }
}

impl fmt::Display for ByzantineBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByzantineBehavior::Delay { ms } => write!(f, "delay:{ms}"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Prepare;
    use linkfail_types::{ReplicaId, RequestId, SeqNumber, ViewNumber};
    use test_case::test_case;

    fn cluster() -> ClusterConfig {
        ClusterConfig::new(4).expect("cluster")
    }

    fn pre_prepare_from_primary() -> Message {
        let request = Request::new(RequestId::new(1), b"op".to_vec());
        Message::broadcast(
            ReplicaId::new(0),
            MessagePayload::PrePrepare(PrePrepare::new(ViewNumber::ZERO, SeqNumber::new(1), request)),
        )
    }

    #[test_case("honest", ByzantineBehavior::Honest; "honest")]
    #[test_case("Equivocate", ByzantineBehavior::Equivocate; "mixed case")]
    #[test_case("silent", ByzantineBehavior::Silent; "silent")]
    #[test_case("delay:50", ByzantineBehavior::Delay { ms: 50 }; "colon")]
    #[test_case("delay=20ms", ByzantineBehavior::Delay { ms: 20 }; "equals with unit")]
    fn parses_behaviours(input: &str, expected: ByzantineBehavior) {
        assert_eq!(input.parse::<ByzantineBehavior>(), Ok(expected));
    }

    #[test]
    fn rejects_unknown_behaviour() {
        assert!("crash".parse::<ByzantineBehavior>().is_err());
        assert!("delay:soon".parse::<ByzantineBehavior>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for behavior in [
            ByzantineBehavior::Honest,
            ByzantineBehavior::Equivocate,
            ByzantineBehavior::Silent,
            ByzantineBehavior::Delay { ms: 7 },
        ] {
            assert_eq!(behavior.to_string().parse::<ByzantineBehavior>(), Ok(behavior));
        }
    }

    #[test]
    fn silent_sends_nothing() {
        let auth = Authenticator::from_seed(1);
        let out = ByzantineBehavior::Silent.shape(pre_prepare_from_primary(), &cluster(), &auth);
        assert!(out.is_empty());
        assert_eq!(ByzantineBehavior::Silent.shape_reply(), None);
    }

    #[test]
    fn delay_adds_latency() {
        let auth = Authenticator::from_seed(1);
        let out = ByzantineBehavior::Delay { ms: 3 }.shape(pre_prepare_from_primary(), &cluster(), &auth);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].extra_delay_ns, 3_000_000);
    }

    #[test]
    fn equivocating_primary_splits_backups() {
        let auth = Authenticator::from_seed(1);
        let original = auth.seal(pre_prepare_from_primary());
        let out = ByzantineBehavior::Equivocate.shape(original, &cluster(), &auth);

        assert_eq!(out.len(), 3);
        let digests: Vec<_> = out
            .iter()
            .map(|o| match &o.message.payload {
                MessagePayload::PrePrepare(pp) => {
                    assert!(pp.is_consistent());
                    pp.digest
                }
                other => panic!("unexpected {}", other.name()),
            })
            .collect();
        assert_eq!(digests[0], digests[2]);
        assert_ne!(digests[0], digests[1]);
        assert!(out.iter().all(|o| auth.verify(&o.message)));
    }

    #[test]
    fn equivocating_backup_corrupts_half_of_votes() {
        let auth = Authenticator::from_seed(1);
        let prepare = Prepare {
            view: ViewNumber::ZERO,
            seq: SeqNumber::new(1),
            digest: linkfail_types::Digest::of(b"x"),
        };
        let msg = auth.seal(Message::broadcast(ReplicaId::new(2), MessagePayload::Prepare(prepare)));
        let out = ByzantineBehavior::Equivocate.shape(msg, &cluster(), &auth);

        let corrupted = out
            .iter()
            .filter(|o| matches!(&o.message.payload, MessagePayload::Prepare(p) if p.digest != prepare.digest))
            .count();
        assert_eq!(out.len(), 3);
        assert_eq!(corrupted, 1);
    }
}
