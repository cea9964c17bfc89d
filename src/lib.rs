//! # drand Light Client
//!
//! Client library for consuming a public distributed randomness beacon
//! over untrusted relays. Every round carries a threshold BLS signature
//! over a round-dependent message; this crate fetches rounds over HTTP,
//! gRPC or gossipsub, verifies them against a known root of trust, and
//! serves them with caching, speed-based failover and a multiplexed
//! watch stream.
//!
//! ## Architecture
//!
//! The read path composes five layers:
//! 1. Transport clients speak one protocol against one relay
//! 2. A verifying client rejects anything whose signature fails
//! 3. An optimizing client races and ranks redundant verifiers
//! 4. A caching client serves repeat rounds from memory
//! 5. A watch aggregator fans one upstream stream out to subscribers
//!
//! ## Example
//!
//! ```no_run
//! use drand_light_client::{Config, HttpClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let chain_hash =
//!     hex::decode("52db9ba70e0cc0f6eaf7803dd07447a1f5477735fd3f661792ba94600c84e971")?;
//!
//! let relay = HttpClient::new("https://api.drand.sh", Some(&chain_hash)).await?;
//! let client = Config::new()
//!     .with_client(Arc::new(relay))
//!     .with_chain_hash(chain_hash)
//!     .build()
//!     .await?;
//!
//! let beacon = client.get(0).await?;
//! println!("round {}: {}", beacon.round, hex::encode(&beacon.randomness));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]
#![allow(missing_docs)] // Internal implementation details

pub mod aggregator;
pub mod beacon;
pub mod builder;
pub mod cache;
pub mod chain;
pub mod client;
pub mod error;
pub mod gossip;
pub mod grpc;
pub mod http;
pub mod metrics;
pub mod optimizing;
pub mod proto;
pub mod scheme;
pub mod verifying;

#[cfg(test)]
pub(crate) mod mock;

pub use aggregator::WatchAggregator;
pub use beacon::Beacon;
pub use builder::{Config, WatcherCtor};
pub use cache::{new_cache, Cache, CachingClient, RoundCache};
pub use chain::{ChainInfo, ChainMetadata};
pub use client::{BeaconStream, Client, EmptyClient, Watcher, WatcherClient};
pub use error::{Error, Result};
pub use gossip::{pubsub_topic, BeaconValidator, GossipClient, GossipConfig, Verdict};
pub use grpc::GrpcClient;
pub use http::HttpClient;
pub use optimizing::{BackendStatus, OptimizingClient, OptimizingOptions};
pub use scheme::{randomness_from_signature, Scheme};
pub use verifying::VerifyingClient;
