//! Protobuf wire messages
//!
//! Hand-derived prost messages for the relay gRPC services and the
//! gossip topic, which both carry `PublicRandResponse`. Field numbers
//! are part of the wire contract and must not change.

use crate::beacon::Beacon;
use crate::chain::{ChainInfo, ChainMetadata, DEFAULT_BEACON_ID, DEFAULT_SCHEME_ID};

/// Request and beacon metadata: selects a chain within a relay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    /// Name of the beacon process
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    /// Chain hash selecting the chain
    #[prost(bytes = "vec", tag = "2")]
    pub chain_hash: Vec<u8>,
}

/// Request for one round of randomness.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicRandRequest {
    /// Round to fetch; 0 means latest
    #[prost(uint64, tag = "1")]
    pub round: u64,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<Metadata>,
}

/// One round of randomness as served by relays and gossiped on pub/sub.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicRandResponse {
    #[prost(uint64, tag = "1")]
    pub round: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub previous_signature: Vec<u8>,
    /// Randomness as claimed by the sender; verified layers recompute it
    #[prost(bytes = "vec", tag = "4")]
    pub randomness: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub metadata: Option<Metadata>,
}

/// Request for a chain descriptor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChainInfoRequest {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
}

/// Chain descriptor, mirroring the HTTP `/info` JSON.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChainInfoPacket {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub period: u32,
    #[prost(int64, tag = "3")]
    pub genesis_time: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub group_hash: Vec<u8>,
    #[prost(string, tag = "6")]
    pub scheme_id: String,
    #[prost(message, optional, tag = "7")]
    pub metadata: Option<Metadata>,
    #[prost(bytes = "vec", tag = "8")]
    pub genesis_seed: Vec<u8>,
}

impl From<PublicRandResponse> for Beacon {
    fn from(resp: PublicRandResponse) -> Self {
        Beacon {
            round: resp.round,
            randomness: resp.randomness,
            signature: resp.signature,
            previous_signature: resp.previous_signature,
        }
    }
}

impl From<&Beacon> for PublicRandResponse {
    fn from(beacon: &Beacon) -> Self {
        PublicRandResponse {
            round: beacon.round,
            signature: beacon.signature.clone(),
            previous_signature: beacon.previous_signature.clone(),
            randomness: beacon.randomness.clone(),
            metadata: None,
        }
    }
}

impl From<ChainInfoPacket> for ChainInfo {
    fn from(packet: ChainInfoPacket) -> Self {
        let beacon_id = packet
            .metadata
            .as_ref()
            .filter(|m| !m.beacon_id.is_empty())
            .map(|m| m.beacon_id.clone())
            .unwrap_or_else(|| DEFAULT_BEACON_ID.to_string());
        ChainInfo {
            public_key: packet.public_key,
            period: packet.period as u64,
            genesis_time: packet.genesis_time,
            hash: packet.hash,
            group_hash: packet.group_hash,
            scheme_id: if packet.scheme_id.is_empty() {
                DEFAULT_SCHEME_ID.to_string()
            } else {
                packet.scheme_id
            },
            metadata: ChainMetadata { beacon_id },
            genesis_seed: packet.genesis_seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn beacon_survives_protobuf_round_trip() {
        let resp = PublicRandResponse {
            round: 42,
            signature: vec![1, 2, 3],
            previous_signature: vec![4, 5],
            randomness: vec![6; 32],
            metadata: None,
        };

        let bytes = resp.encode_to_vec();
        let decoded = PublicRandResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(resp, decoded);

        let beacon: Beacon = decoded.into();
        assert_eq!(beacon.round, 42);
        assert_eq!(beacon.signature, vec![1, 2, 3]);
        assert_eq!(beacon.previous_signature, vec![4, 5]);
    }

    #[test]
    fn chain_info_packet_maps_onto_chain_info() {
        let packet = ChainInfoPacket {
            public_key: vec![0x83; 48],
            period: 30,
            genesis_time: 1_595_431_050,
            hash: vec![],
            group_hash: vec![],
            scheme_id: String::new(),
            metadata: None,
            genesis_seed: vec![0x11; 32],
        };
        let info: ChainInfo = packet.into();
        assert_eq!(info.period, 30);
        assert_eq!(info.scheme_id, "pedersen-bls-chained");
        assert_eq!(info.metadata.beacon_id, "default");
    }
}
