//! Pub/sub message validation
//!
//! Every message on the beacon topic passes through here before it is
//! propagated or delivered. The verdict feeds the pub/sub layer's peer
//! scoring: REJECT penalizes the sender, IGNORE drops silently.

use crate::cache::Cache;
use crate::chain::{unix_seconds, ChainInfo};
use crate::error::Result;
use crate::proto::PublicRandResponse;
use crate::scheme::Scheme;
use prost::Message;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Validation outcome for one pub/sub message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Valid and new: propagate and deliver
    Accept,
    /// Duplicate of a cached beacon: drop without penalty
    Ignore,
    /// Malformed, future, equivocating or unverifiable: penalize sender
    Reject,
}

/// Topic validator for gossiped beacons.
pub struct BeaconValidator {
    info: Option<ChainInfo>,
    scheme: Option<Scheme>,
    cache: Option<Arc<dyn Cache>>,
}

impl BeaconValidator {
    /// Validator bound to a root of trust. Without one the validator
    /// accepts anything decodable (unverified relay mode).
    pub fn new(info: Option<ChainInfo>, cache: Option<Arc<dyn Cache>>) -> Result<Self> {
        let scheme = match &info {
            Some(info) => Some(Scheme::from_id(&info.scheme_id)?),
            None => None,
        };
        Ok(Self {
            info,
            scheme,
            cache,
        })
    }

    /// Validate one raw topic message at time `now`.
    pub fn validate(&self, data: &[u8], now: SystemTime) -> Verdict {
        let rand = match PublicRandResponse::decode(data) {
            Ok(rand) => rand,
            Err(err) => {
                warn!(%err, "gossip validator: undecodable message");
                return Verdict::Reject;
            }
        };
        debug!(round = rand.round, "gossip validator: received round");

        let (info, scheme) = match (&self.info, self.scheme) {
            (Some(info), Some(scheme)) => (info, scheme),
            _ => {
                warn!("gossip validator: no trust root, accepting unverified");
                return Verdict::Accept;
            }
        };

        // Unwilling to relay beacons from the future.
        if info.time_of_round(rand.round) > unix_seconds(now) {
            warn!(
                round = rand.round,
                "gossip validator: rejecting future beacon"
            );
            return Verdict::Reject;
        }

        // A cached round settles the question: identical payloads are
        // duplicates, anything else is equivocation.
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.try_get(rand.round) {
                let identical = cached.round == rand.round
                    && cached.signature == rand.signature
                    && cached.previous_signature == rand.previous_signature
                    && cached.randomness == rand.randomness;
                if identical {
                    debug!(round = rand.round, "gossip validator: duplicate");
                    return Verdict::Ignore;
                }
                warn!(round = rand.round, "gossip validator: equivocation");
                return Verdict::Reject;
            }
        }

        if rand.round == 0 || rand.signature.is_empty() {
            return Verdict::Reject;
        }
        match scheme.verify(
            &info.public_key,
            rand.round,
            &rand.previous_signature,
            &rand.signature,
        ) {
            Ok(()) => Verdict::Accept,
            Err(err) => {
                warn!(round = rand.round, %err, "gossip validator: bad signature");
                Verdict::Reject
            }
        }
    }
}
