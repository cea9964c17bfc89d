//! Beacon signature schemes
//!
//! Maps a chain's `schemeID` onto the message derivation and the
//! BLS12-381 verification primitive. Chained schemes bind each round to
//! the previous round's signature; unchained schemes sign the round
//! number alone, which allows pre-computing the message for any round.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Domain separation tag for signatures on G2 (public keys on G1).
const DST_G2: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Domain separation tag for signatures on G1 (public keys on G2).
const DST_G1: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// A supported beacon signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Default chained scheme: signatures on G2, public key on G1
    PedersenBlsChained,
    /// Unchained scheme on G2 signatures
    PedersenBlsUnchained,
    /// Legacy unchained scheme with signatures on G1 but the G2 tag
    UnchainedOnG1,
    /// RFC 9380 unchained scheme: signatures on G1, public key on G2
    UnchainedG1Rfc9380,
}

impl Scheme {
    /// Resolve a chain's `schemeID`.
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "pedersen-bls-chained" => Ok(Scheme::PedersenBlsChained),
            "pedersen-bls-unchained" => Ok(Scheme::PedersenBlsUnchained),
            "bls-unchained-on-g1" => Ok(Scheme::UnchainedOnG1),
            "bls-unchained-g1-rfc9380" => Ok(Scheme::UnchainedG1Rfc9380),
            other => Err(Error::InvalidConfig(format!(
                "unknown scheme id {other:?}"
            ))),
        }
    }

    /// The chain `schemeID` this scheme answers to.
    pub fn id(&self) -> &'static str {
        match self {
            Scheme::PedersenBlsChained => "pedersen-bls-chained",
            Scheme::PedersenBlsUnchained => "pedersen-bls-unchained",
            Scheme::UnchainedOnG1 => "bls-unchained-on-g1",
            Scheme::UnchainedG1Rfc9380 => "bls-unchained-g1-rfc9380",
        }
    }

    /// Whether each round's message commits to the previous signature.
    pub fn is_chained(&self) -> bool {
        matches!(self, Scheme::PedersenBlsChained)
    }

    /// Whether signatures live on G1 (public keys on G2).
    pub(crate) fn signature_on_g1(&self) -> bool {
        matches!(self, Scheme::UnchainedOnG1 | Scheme::UnchainedG1Rfc9380)
    }

    pub(crate) fn dst(&self) -> &'static [u8] {
        match self {
            // the legacy G1 scheme kept the G2 tag
            Scheme::UnchainedG1Rfc9380 => DST_G1,
            _ => DST_G2,
        }
    }

    /// The message signed for `round`.
    ///
    /// Chained: `SHA-256(previous_signature || round_be)`; the previous
    /// signature must be present. Unchained: `SHA-256(round_be)`.
    pub fn beacon_message(&self, round: u64, previous_signature: &[u8]) -> Result<Vec<u8>> {
        if self.is_chained() {
            if previous_signature.is_empty() {
                return Err(Error::InvalidBeacon(format!(
                    "chained scheme requires a previous signature for round {round}"
                )));
            }
            let mut hasher = Sha256::new();
            hasher.update(previous_signature);
            hasher.update(round.to_be_bytes());
            Ok(hasher.finalize().to_vec())
        } else {
            Ok(Sha256::digest(round.to_be_bytes()).to_vec())
        }
    }

    /// Verify `signature` over the message for `round` under `public_key`.
    pub fn verify(
        &self,
        public_key: &[u8],
        round: u64,
        previous_signature: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let message = self.beacon_message(round, previous_signature)?;
        let ok = if self.signature_on_g1() {
            verify_min_sig(public_key, &message, signature, self.dst())?
        } else {
            verify_min_pk(public_key, &message, signature, self.dst())?
        };
        if !ok {
            return Err(Error::InvalidBeacon(format!(
                "signature verification failed for round {round}"
            )));
        }
        Ok(())
    }
}

/// Signatures on G2, public keys on G1 (48-byte keys).
fn verify_min_pk(public_key: &[u8], message: &[u8], signature: &[u8], dst: &[u8]) -> Result<bool> {
    use blst::min_pk::{PublicKey, Signature};

    let pk = PublicKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidBeacon(format!("bad G1 public key: {e:?}")))?;
    let sig = Signature::from_bytes(signature)
        .map_err(|e| Error::InvalidBeacon(format!("bad G2 signature: {e:?}")))?;
    Ok(sig.verify(true, message, dst, &[], &pk, true) == blst::BLST_ERROR::BLST_SUCCESS)
}

/// Signatures on G1, public keys on G2 (96-byte keys).
fn verify_min_sig(public_key: &[u8], message: &[u8], signature: &[u8], dst: &[u8]) -> Result<bool> {
    use blst::min_sig::{PublicKey, Signature};

    let pk = PublicKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidBeacon(format!("bad G2 public key: {e:?}")))?;
    let sig = Signature::from_bytes(signature)
        .map_err(|e| Error::InvalidBeacon(format!("bad G1 signature: {e:?}")))?;
    Ok(sig.verify(true, message, dst, &[], &pk, true) == blst::BLST_ERROR::BLST_SUCCESS)
}

/// Randomness derivation shared by every scheme: `SHA-256(signature)`.
pub fn randomness_from_signature(signature: &[u8]) -> Vec<u8> {
    Sha256::digest(signature).to_vec()
}
