//! gRPC transport
//!
//! Unary `PublicRand` for `get`, server-streaming `PublicRandStream`
//! for `watch`, and `ChainInfo` during construction. The chain hash is
//! injected as request metadata so multi-chain relays serve the right
//! chain. Calls go through hand-rolled method paths over one shared
//! channel.

use crate::beacon::Beacon;
use crate::chain::ChainInfo;
use crate::client::{BeaconStream, Client};
use crate::error::{Error, Result};
use crate::proto::{ChainInfoRequest, Metadata, PublicRandRequest, PublicRandResponse};
use crate::scheme::randomness_from_signature;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::warn;

const PUBLIC_RAND_PATH: &str = "/drand.Public/PublicRand";
const PUBLIC_RAND_STREAM_PATH: &str = "/drand.Public/PublicRandStream";
const CHAIN_INFO_PATH: &str = "/drand.Public/ChainInfo";

/// Client fetching beacons from one gRPC relay.
#[derive(Clone)]
pub struct GrpcClient {
    state: Arc<GrpcState>,
}

struct GrpcState {
    addr: String,
    channel: Channel,
    info: ChainInfo,
    chain_hash: Vec<u8>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl GrpcClient {
    /// Connect to `addr` (a `host:port` or full URI), fetching chain
    /// info during construction. `insecure` disables TLS.
    ///
    /// As with HTTP, a pinned `chain_hash` must match the hash of the
    /// fetched chain info or construction fails.
    pub async fn new(addr: &str, chain_hash: Option<&[u8]>, insecure: bool) -> Result<Self> {
        let channel = build_channel(addr, insecure)?;

        let request_hash = chain_hash.map(|h| h.to_vec()).unwrap_or_default();
        let info = fetch_chain_info(&channel, &request_hash).await?;
        info.validate()?;
        if let Some(hash) = chain_hash {
            info.verify_chain_hash(hash)?;
        }

        let chain_hash = info.chain_hash();
        Ok(Self {
            state: Arc::new(GrpcState {
                addr: addr.to_string(),
                channel,
                info,
                chain_hash,
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Connect to `addr` with already known chain info.
    pub fn with_info(addr: &str, info: ChainInfo, insecure: bool) -> Result<Self> {
        info.validate()?;
        let channel = build_channel(addr, insecure)?;
        let chain_hash = info.chain_hash();
        Ok(Self {
            state: Arc::new(GrpcState {
                addr: addr.to_string(),
                channel,
                info,
                chain_hash,
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

fn build_channel(addr: &str, insecure: bool) -> Result<Channel> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else if insecure {
        format!("http://{addr}")
    } else {
        format!("https://{addr}")
    };

    let mut endpoint = Endpoint::from_shared(uri)
        .map_err(|e| Error::InvalidConfig(format!("bad grpc address {addr:?}: {e}")))?;
    if !insecure {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| Error::InvalidConfig(format!("tls config: {e}")))?;
    }
    Ok(endpoint.connect_lazy())
}

async fn fetch_chain_info(channel: &Channel, chain_hash: &[u8]) -> Result<ChainInfo> {
    let mut grpc = tonic::client::Grpc::new(channel.clone());
    grpc.ready()
        .await
        .map_err(|e| Error::Network(format!("grpc channel not ready: {e}")))?;

    let request = ChainInfoRequest {
        metadata: Some(Metadata {
            beacon_id: String::new(),
            chain_hash: chain_hash.to_vec(),
        }),
    };
    let codec = tonic::codec::ProstCodec::default();
    let path = PathAndQuery::from_static(CHAIN_INFO_PATH);
    let response: tonic::Response<crate::proto::ChainInfoPacket> = grpc
        .unary(tonic::Request::new(request), path, codec)
        .await
        .map_err(Error::from)?;
    Ok(response.into_inner().into())
}

impl GrpcState {
    fn request_metadata(&self) -> Option<Metadata> {
        Some(Metadata {
            beacon_id: self.info.metadata.beacon_id.clone(),
            chain_hash: self.chain_hash.clone(),
        })
    }

    async fn fetch_beacon(&self, round: u64) -> Result<Beacon> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::Network(format!("grpc channel not ready: {e}")))?;

        let request = PublicRandRequest {
            round,
            metadata: self.request_metadata(),
        };
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(PUBLIC_RAND_PATH);

        let call = grpc.unary(tonic::Request::new(request), path, codec);
        let response: tonic::Response<PublicRandResponse> = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            response = call => response.map_err(Error::from)?,
        };

        let mut beacon: Beacon = response.into_inner().into();
        beacon.check_wire()?;
        beacon.randomness = randomness_from_signature(&beacon.signature);
        Ok(beacon)
    }
}

impl std::fmt::Debug for GrpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcClient")
            .field("addr", &self.state.addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for GrpcClient {
    async fn info(&self) -> Result<ChainInfo> {
        Ok(self.state.info.clone())
    }

    async fn get(&self, round: u64) -> Result<Beacon> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.state.fetch_beacon(round).await
    }

    async fn watch(&self) -> BeaconStream {
        if self.state.closed.load(Ordering::SeqCst) {
            return futures::stream::empty().boxed();
        }

        let state = self.state.clone();
        let mut grpc = tonic::client::Grpc::new(state.channel.clone());
        if let Err(err) = grpc.ready().await {
            warn!(addr = %state.addr, %err, "grpc watch: channel not ready");
            return futures::stream::empty().boxed();
        }

        let request = PublicRandRequest {
            round: 0,
            metadata: state.request_metadata(),
        };
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(PUBLIC_RAND_STREAM_PATH);
        let mut upstream: tonic::codec::Streaming<PublicRandResponse> =
            match grpc.server_streaming(tonic::Request::new(request), path, codec).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    warn!(addr = %state.addr, %status, "grpc watch: stream failed to open");
                    return futures::stream::empty().boxed();
                }
            };

        let (tx, rx) = mpsc::channel::<Beacon>(1);
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    item = upstream.next() => item,
                };
                match item {
                    Some(Ok(resp)) => {
                        let mut beacon: Beacon = resp.into();
                        if beacon.check_wire().is_err() {
                            warn!(addr = %state.addr, "grpc watch: dropping malformed beacon");
                            continue;
                        }
                        beacon.randomness = randomness_from_signature(&beacon.signature);
                        if tx.send(beacon).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(status)) => {
                        warn!(addr = %state.addr, %status, "grpc watch: stream error");
                        return;
                    }
                    None => return,
                }
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.state.info.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.cancel.cancel();
        Ok(())
    }

    fn name(&self) -> String {
        format!("grpc({})", self.state.addr)
    }
}
