//! Beacon round value object
//!
//! A beacon is one round of signed randomness as published by a relay.
//! The signature is the sole authoritative payload; the randomness field
//! is a cached derivation that verified layers recompute and never trust
//! as received.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// One round of beacon output.
///
/// Byte fields serialize as lowercase hex strings, matching the relay
/// JSON API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    /// Round number, strictly positive and monotonic per chain
    pub round: u64,

    /// Randomness derived from the signature, `SHA-256(signature)`
    #[serde(with = "hex::serde", default, skip_serializing_if = "Vec::is_empty")]
    pub randomness: Vec<u8>,

    /// Threshold BLS signature over the round's message
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,

    /// Signature of the previous round; empty for unchained schemes
    #[serde(with = "hex::serde", default, skip_serializing_if = "Vec::is_empty")]
    pub previous_signature: Vec<u8>,
}

impl Beacon {
    /// Structural checks shared by every transport: a relay response with
    /// round 0 or without a signature is never usable.
    pub fn check_wire(&self) -> Result<()> {
        if self.round == 0 {
            return Err(Error::Decode("relay returned round 0".into()));
        }
        if self.signature.is_empty() {
            return Err(Error::Decode(
                "insufficient response: signature is not present".into(),
            ));
        }
        Ok(())
    }
}
