//! HTTP transport
//!
//! Fetches chain info and beacons from a relay's JSON API. `watch` is
//! implemented by polling once per period, aligned to round boundaries.
//! Construction refuses to proceed when the relay's advertised chain
//! does not hash to the caller's pinned chain hash.

use crate::beacon::Beacon;
use crate::chain::{unix_seconds, ChainInfo, DEFAULT_BEACON_ID};
use crate::client::{polling_watcher, BeaconStream, Client};
use crate::error::{Error, Result};
use crate::metrics;
use crate::scheme::randomness_from_signature;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout applied to individual beacon and info requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout applied to health probes.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Period between heartbeats of the health probe task.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("drand-light-client/", env!("CARGO_PKG_VERSION"));

/// Client fetching beacons from one HTTP relay.
#[derive(Clone)]
pub struct HttpClient {
    state: Arc<HttpState>,
}

struct HttpState {
    root: String,
    http: reqwest::Client,
    info: ChainInfo,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl HttpClient {
    /// Connect to `url`, fetching chain info during construction.
    ///
    /// When `chain_hash` is given, construction fails unless the fetched
    /// info hashes to it. Without a pinned hash the relay must advertise
    /// the default beacon.
    pub async fn new(url: &str, chain_hash: Option<&[u8]>) -> Result<Self> {
        let root = normalize_root(url);
        let http = build_http()?;
        let info = fetch_chain_info(&http, &root, chain_hash).await?;
        Ok(Self::assemble(root, http, info))
    }

    /// Connect to `url` with already known chain info; no network access
    /// happens during construction.
    pub fn with_info(url: &str, info: ChainInfo) -> Result<Self> {
        let root = normalize_root(url);
        let http = build_http()?;
        info.validate()?;
        Ok(Self::assemble(root, http, info))
    }

    fn assemble(root: String, http: reqwest::Client, info: ChainInfo) -> Self {
        Self {
            state: Arc::new(HttpState {
                root,
                http,
                info,
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Build clients for a set of relay URLs sharing one chain.
    ///
    /// Chain info is fetched from the first reachable relay and reused
    /// for the rest; relays that fail the initial fetch are retried with
    /// the known info so a single bad endpoint does not shrink the set.
    pub async fn for_urls(urls: &[String], chain_hash: &[u8]) -> Vec<Arc<dyn Client>> {
        let mut clients: Vec<Arc<dyn Client>> = Vec::new();
        let mut info: Option<ChainInfo> = None;
        let mut skipped: Vec<&String> = Vec::new();

        for url in urls {
            match &info {
                None => match Self::new(url, Some(chain_hash)).await {
                    Ok(client) => {
                        info = Some(client.state.info.clone());
                        clients.push(Arc::new(client));
                    }
                    Err(err) => {
                        warn!(%url, %err, "skipping relay during construction");
                        skipped.push(url);
                    }
                },
                Some(known) => {
                    if let Ok(client) = Self::with_info(url, known.clone()) {
                        clients.push(Arc::new(client));
                    }
                }
            }
        }
        if let Some(known) = info {
            for url in skipped {
                if let Ok(client) = Self::with_info(url, known.clone()) {
                    clients.push(Arc::new(client));
                }
            }
        }
        clients
    }

    /// Probe the relay's `/health` endpoint.
    pub async fn ping(root: &str) -> Result<()> {
        let http = build_http()?;
        let url = format!("{}health", normalize_root(root));
        let response = http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(Error::from)?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    /// Spawn a heartbeat task recording latency and success of this
    /// relay to the metrics registry until the client closes.
    pub fn start_heartbeats(&self, interval: Duration) {
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let started = Instant::now();
                match state.fetch_beacon(0).await {
                    Ok(beacon) => {
                        metrics::HEARTBEAT_SUCCESS
                            .with_label_values(&[&state.root])
                            .inc();
                        let expected = state.info.time_of_round(beacon.round) * 1000;
                        let actual = unix_seconds(SystemTime::now()) * 1000;
                        metrics::HEARTBEAT_LAG
                            .with_label_values(&[&state.root])
                            .set((actual - expected) as f64);
                        debug!(
                            root = %state.root,
                            round = beacon.round,
                            latency_ms = started.elapsed().as_millis() as u64,
                            "heartbeat"
                        );
                    }
                    Err(err) => {
                        metrics::HEARTBEAT_FAILURE
                            .with_label_values(&[&state.root])
                            .inc();
                        warn!(root = %state.root, %err, "heartbeat failed");
                    }
                }
            }
        });
    }
}

impl HttpState {
    async fn fetch_beacon(&self, round: u64) -> Result<Beacon> {
        let hash = self.info.chain_hash_hex();
        let url = if round == 0 {
            format!("{}{}/public/latest", self.root, hash)
        } else {
            format!("{}{}/public/{}", self.root, hash, round)
        };

        let request = self.http.get(&url).send();
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Closed),
            response = request => response.map_err(Error::from)?,
        };
        if !response.status().is_success() {
            return Err(Error::HttpStatus(response.status().as_u16()));
        }

        let mut beacon: Beacon = response.json().await.map_err(Error::from)?;
        beacon.check_wire()?;
        beacon.randomness = randomness_from_signature(&beacon.signature);
        Ok(beacon)
    }
}

fn normalize_root(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn build_http() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(Error::from)
}

/// Fetch and validate chain info from a relay root.
async fn fetch_chain_info(
    http: &reqwest::Client,
    root: &str,
    chain_hash: Option<&[u8]>,
) -> Result<ChainInfo> {
    let url = match chain_hash {
        Some(hash) => format!("{root}{}/info", hex::encode(hash)),
        None => format!("{root}info"),
    };

    let response = http.get(&url).send().await.map_err(Error::from)?;
    if !response.status().is_success() {
        return Err(Error::HttpStatus(response.status().as_u16()));
    }
    let info: ChainInfo = response.json().await.map_err(Error::from)?;
    info.validate()?;

    match chain_hash {
        Some(hash) => info.verify_chain_hash(hash)?,
        None => {
            warn!(
                root,
                chain_hash = %info.chain_hash_hex(),
                "instantiated without a pinned chain hash"
            );
            if info.metadata.beacon_id != DEFAULT_BEACON_ID {
                return Err(Error::InvalidConfig(format!(
                    "{root} does not serve the default beacon; pin a chain hash to select {:?}",
                    info.metadata.beacon_id
                )));
            }
        }
    }
    Ok(info)
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("root", &self.state.root)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for HttpClient {
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
        let client: Arc<dyn Client> = Arc::new(self.clone());
        polling_watcher(
            client,
            self.state.info.clone(),
            self.state.cancel.child_token(),
        )
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
        format!("http({})", self.state.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::TestChain;
    use crate::scheme::Scheme;
    use axum::extract::{Path, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use futures::StreamExt;
    use std::net::SocketAddr;

    #[derive(Clone)]
    struct Relay {
        info: ChainInfo,
        chain: Arc<TestChain>,
    }

    async fn serve_relay(chain: TestChain) -> (SocketAddr, Relay) {
        let relay = Relay {
            info: chain.info(),
            chain: Arc::new(chain),
        };

        let app = Router::new()
            .route(
                "/health",
                get(|| async { Json(serde_json::json!({"status": "ok"})) }),
            )
            .route(
                "/:hash/info",
                get(|State(relay): State<Relay>| async move { Json(relay.info.clone()) }),
            )
            .route(
                "/:hash/public/latest",
                get(|State(relay): State<Relay>| async move {
                    Json(relay.chain.beacon(100))
                }),
            )
            .route(
                "/:hash/public/:round",
                get(
                    |State(relay): State<Relay>, Path((_hash, round)): Path<(String, u64)>| async move {
                        Json(relay.chain.beacon(round))
                    },
                ),
            )
            .with_state(relay.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, relay)
    }

    #[tokio::test]
    async fn fetches_and_validates_chain_info_on_construction() {
        let chain = TestChain::new(Scheme::UnchainedG1Rfc9380);
        let expected_hash = chain.info().chain_hash();
        let (addr, _relay) = serve_relay(chain).await;

        let client = HttpClient::new(&format!("http://{addr}"), Some(&expected_hash))
            .await
            .unwrap();
        assert_eq!(client.info().await.unwrap().chain_hash(), expected_hash);
    }

    #[tokio::test]
    async fn refuses_construction_on_chain_hash_mismatch() {
        let chain = TestChain::new(Scheme::UnchainedG1Rfc9380);
        let (addr, _relay) = serve_relay(chain).await;

        let err = HttpClient::new(&format!("http://{addr}"), Some(&[0u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainHashMismatch { .. }));
    }

    #[tokio::test]
    async fn get_fetches_the_requested_round() {
        let chain = TestChain::new(Scheme::UnchainedG1Rfc9380);
        let hash = chain.info().chain_hash();
        let (addr, _relay) = serve_relay(chain).await;

        let client = HttpClient::new(&format!("http://{addr}"), Some(&hash))
            .await
            .unwrap();
        let beacon = client.get(1234).await.unwrap();
        assert_eq!(beacon.round, 1234);
        assert_eq!(
            beacon.randomness,
            randomness_from_signature(&beacon.signature)
        );
    }

    #[tokio::test]
    async fn get_zero_fetches_latest() {
        let chain = TestChain::new(Scheme::UnchainedG1Rfc9380);
        let hash = chain.info().chain_hash();
        let (addr, _relay) = serve_relay(chain).await;

        let client = HttpClient::new(&format!("http://{addr}"), Some(&hash))
            .await
            .unwrap();
        assert_eq!(client.get(0).await.unwrap().round, 100);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_gets() {
        let chain = TestChain::new(Scheme::UnchainedG1Rfc9380);
        let hash = chain.info().chain_hash();
        let (addr, _relay) = serve_relay(chain).await;

        let client = HttpClient::new(&format!("http://{addr}"), Some(&hash))
            .await
            .unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(matches!(client.get(5).await.unwrap_err(), Error::Closed));
        let mut stream = client.watch().await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn ping_hits_the_health_endpoint() {
        let chain = TestChain::new(Scheme::UnchainedG1Rfc9380);
        let (addr, _relay) = serve_relay(chain).await;

        HttpClient::ping(&format!("http://{addr}")).await.unwrap();
        assert!(HttpClient::ping("http://127.0.0.1:1").await.is_err());
    }

    #[tokio::test]
    async fn for_urls_tolerates_a_dead_relay() {
        let chain = TestChain::new(Scheme::UnchainedG1Rfc9380);
        let hash = chain.info().chain_hash();
        let (addr, _relay) = serve_relay(chain).await;

        let urls = vec![
            "http://127.0.0.1:1".to_string(),
            format!("http://{addr}"),
        ];
        let clients = HttpClient::for_urls(&urls, &hash).await;
        // the dead relay is retried with the known info, so both survive
        assert_eq!(clients.len(), 2);
    }
}
