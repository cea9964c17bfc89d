//! Chain info: the immutable root of trust for a beacon chain
//!
//! A chain is identified by its distributed public key, round period,
//! genesis time and signature scheme. The deterministic hash over those
//! fields is the short identifier callers pin ("chain hash"); two chain
//! infos are equal exactly when their hashes match.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Scheme id whose presence is implied and therefore excluded from the
/// chain hash preimage.
pub const DEFAULT_SCHEME_ID: &str = "pedersen-bls-chained";

/// Beacon id whose presence is implied and therefore excluded from the
/// chain hash preimage.
pub const DEFAULT_BEACON_ID: &str = "default";

/// Immutable descriptor of a beacon chain.
///
/// Fetched once at construction and frozen; byte fields serialize as
/// lowercase hex, matching the relay `/info` JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Distributed public key of the chain (compressed group element)
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,

    /// Seconds between rounds, strictly positive
    pub period: u64,

    /// Unix time of round 1
    pub genesis_time: i64,

    /// Chain hash as advertised by the relay; validated, never trusted
    #[serde(with = "hex::serde", default, skip_serializing_if = "Vec::is_empty")]
    pub hash: Vec<u8>,

    /// Hash of the original group file
    #[serde(
        rename = "groupHash",
        with = "hex::serde",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub group_hash: Vec<u8>,

    /// Signature scheme identifier, selects chained vs unchained
    #[serde(rename = "schemeID", default = "default_scheme_id")]
    pub scheme_id: String,

    /// Human-readable metadata
    #[serde(default)]
    pub metadata: ChainMetadata,

    /// Seed acting as the previous signature of round 1
    #[serde(with = "hex::serde", default, skip_serializing_if = "Vec::is_empty")]
    pub genesis_seed: Vec<u8>,
}

/// Metadata block of the relay `/info` JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainMetadata {
    /// Name of the beacon process emitting this chain
    #[serde(rename = "beaconID", default = "default_beacon_id")]
    pub beacon_id: String,
}

impl Default for ChainMetadata {
    fn default() -> Self {
        Self {
            beacon_id: DEFAULT_BEACON_ID.to_string(),
        }
    }
}

fn default_scheme_id() -> String {
    DEFAULT_SCHEME_ID.to_string()
}

fn default_beacon_id() -> String {
    DEFAULT_BEACON_ID.to_string()
}

impl ChainInfo {
    /// Deterministic hash binding every trust-relevant field.
    ///
    /// Preimage: period (u32 seconds, big-endian), genesis time (i64
    /// big-endian), public key, genesis seed, then the scheme id when not
    /// the default scheme and the beacon id when not `"default"`.
    pub fn chain_hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update((self.period as u32).to_be_bytes());
        hasher.update(self.genesis_time.to_be_bytes());
        hasher.update(&self.public_key);
        hasher.update(&self.genesis_seed);
        if self.scheme_id != DEFAULT_SCHEME_ID {
            hasher.update(self.scheme_id.as_bytes());
        }
        if self.metadata.beacon_id != DEFAULT_BEACON_ID {
            hasher.update(self.metadata.beacon_id.as_bytes());
        }
        hasher.finalize().to_vec()
    }

    /// Hex form of [`chain_hash`](Self::chain_hash), as used in URLs and
    /// pub/sub topics.
    pub fn chain_hash_hex(&self) -> String {
        hex::encode(self.chain_hash())
    }

    /// Fails unless the computed hash equals `expected`.
    pub fn verify_chain_hash(&self, expected: &[u8]) -> Result<()> {
        let actual = self.chain_hash();
        if actual != expected {
            return Err(Error::ChainHashMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }

    /// Structural validation of a freshly parsed descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.public_key.is_empty() {
            return Err(Error::Decode(
                "chain info does not carry a public key".into(),
            ));
        }
        if self.period == 0 {
            return Err(Error::Decode("chain info has a zero period".into()));
        }
        Ok(())
    }

    /// Round period as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    /// Unix time at which `round` becomes available:
    /// `genesis_time + (round - 1) * period`.
    pub fn time_of_round(&self, round: u64) -> i64 {
        self.genesis_time + (round.saturating_sub(1) * self.period) as i64
    }

    /// Latest round available at unix time `now`; 0 before genesis.
    pub fn current_round(&self, now: i64) -> u64 {
        if now < self.genesis_time {
            return 0;
        }
        ((now - self.genesis_time) as u64 / self.period) + 1
    }

    /// Latest round available at wall-clock time `t`.
    pub fn round_at(&self, t: SystemTime) -> u64 {
        self.current_round(unix_seconds(t))
    }

    /// The round following the one current at `now`, with the unix time
    /// it becomes available. Used to align polling to round boundaries.
    pub fn next_round(&self, now: i64) -> (u64, i64) {
        let next = self.current_round(now) + 1;
        (next, self.time_of_round(next))
    }
}

/// Chain infos are equal iff their hashes match.
impl PartialEq for ChainInfo {
    fn eq(&self, other: &Self) -> bool {
        self.chain_hash() == other.chain_hash()
    }
}

impl Eq for ChainInfo {}

/// Unix seconds of a wall-clock time; times before the epoch clamp to 0.
pub fn unix_seconds(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
