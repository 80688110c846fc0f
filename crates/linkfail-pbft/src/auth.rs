//! Abstract message authenticator.
//!
//! Replicas stamp each envelope with a keyed BLAKE3 MAC derived from a
//! per-run cluster secret and the sender id. This models the
//! "authenticator capability" of PBFT without public-key signatures: a
//! replica cannot produce a token that verifies under another sender's
//! identity, and any tampering with the payload is detected.

use linkfail_types::ReplicaId;
use serde::{Deserialize, Serialize};

use crate::message::Message;

const AUTH_CONTEXT: &str = "linkfail 2024 replica authenticator";

/// Length of an [`AuthToken`].
pub const AUTH_TOKEN_LENGTH: usize = 16;

/// Truncated MAC over an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthToken([u8; AUTH_TOKEN_LENGTH]);

impl AuthToken {
    pub fn as_bytes(&self) -> &[u8; AUTH_TOKEN_LENGTH] {
        &self.0
    }
}

/// Seals and verifies message envelopes for one cluster.
#[derive(Debug, Clone)]
pub struct Authenticator {
    cluster_secret: [u8; 32],
}

impl Authenticator {
    /// Derives the cluster secret from a run seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            cluster_secret: blake3::derive_key(AUTH_CONTEXT, &seed.to_le_bytes()),
        }
    }

    fn sender_key(&self, sender: ReplicaId) -> [u8; 32] {
        let mut material = [0u8; 33];
        material[..32].copy_from_slice(&self.cluster_secret);
        material[32] = sender.as_u8();
        blake3::derive_key(AUTH_CONTEXT, &material)
    }

    fn compute(&self, message: &Message) -> Option<AuthToken> {
        let payload = postcard::to_allocvec(&message.payload).ok()?;
        let mut hasher = blake3::Hasher::new_keyed(&self.sender_key(message.from));
        hasher.update(&[message.from.as_u8()]);
        match message.to {
            Some(to) => hasher.update(&[1, to.as_u8()]),
            None => hasher.update(&[0, 0]),
        };
        hasher.update(&payload);
        let mut token = [0u8; AUTH_TOKEN_LENGTH];
        token.copy_from_slice(&hasher.finalize().as_bytes()[..AUTH_TOKEN_LENGTH]);
        Some(AuthToken(token))
    }

    /// Stamps `message` with its token.
    pub fn seal(&self, mut message: Message) -> Message {
        message.auth = self.compute(&message);
        message
    }

    /// True if the envelope carries a token that matches its contents.
    ///
    /// A broadcast sealed before fan-out stays valid after the transport
    /// retargets it, so the token of a targeted copy is checked against
    /// both the targeted and the broadcast form.
    pub fn verify(&self, message: &Message) -> bool {
        let Some(token) = message.auth else {
            return false;
        };
        if self.compute(message) == Some(token) {
            return true;
        }
        if message.to.is_some() {
            let as_broadcast = Message {
                to: None,
                ..message.clone()
            };
            return self.compute(&as_broadcast) == Some(token);
        }
        false
    }
}
