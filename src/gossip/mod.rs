//! Gossip subscription bridge
//!
//! Turns a pub/sub beacon topic into the same verified stream the other
//! transports provide. A validator gates every message before delivery;
//! accepted beacons are fanned out to subscribers with bounded buffers
//! and a monotonic `latest` counter suppressing out-of-order replays.

mod node;
mod validator;

pub use node::GossipConfig;
pub use validator::{BeaconValidator, Verdict};

use crate::beacon::Beacon;
use crate::cache::Cache;
use crate::chain::ChainInfo;
use crate::client::{BeaconStream, Client, Watcher};
use crate::error::{Error, Result};
use crate::metrics;
use crate::proto::PublicRandResponse;
use crate::scheme::randomness_from_signature;
use async_trait::async_trait;
use futures::StreamExt;
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many beacons a subscriber may lag before deliveries to it are
/// dropped.
pub const WATCH_BUFFER_SIZE: usize = 100;

/// Pub/sub topic carrying a chain's beacons.
pub fn pubsub_topic(chain_hash_hex: &str) -> String {
    format!("/drand/pubsub/v0.0.0/{chain_hash_hex}")
}

/// Client receiving beacons from a gossipsub topic.
///
/// `get` is unsupported; the layer above serves cached rounds. The
/// client usually enters the stack as the builder's watcher so it
/// participates as a passive backend.
#[derive(Clone)]
pub struct GossipClient {
    state: Arc<GossipState>,
}

struct GossipState {
    info: ChainInfo,
    cache: Option<Arc<dyn Cache>>,
    latest: AtomicU64,
    subs: Mutex<HashMap<u64, mpsc::Sender<Beacon>>>,
    next_sub: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl GossipClient {
    /// Join the chain's topic over a freshly spawned libp2p node and
    /// start validating incoming messages.
    pub fn connect(
        config: GossipConfig,
        info: ChainInfo,
        cache: Option<Arc<dyn Cache>>,
    ) -> Result<Self> {
        let client = Self::detached(info.clone(), cache.clone());
        let validator = BeaconValidator::new(Some(info.clone()), cache)?;

        let topic = pubsub_topic(&info.chain_hash_hex());
        let (mut incoming, verdicts) =
            node::spawn_node(topic, config, client.state.cancel.child_token())?;

        let state = client.state.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    event = incoming.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                let verdict =
                    state.handle_message(&validator, &event.data, SystemTime::now());
                if verdicts
                    .send((event.message_id, event.source, verdict))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        Ok(client)
    }

    /// Client without transport plumbing; messages are pushed through
    /// [`handle_message`](Self::handle_message). Used by the relay
    /// bridge and by tests.
    pub fn detached(info: ChainInfo, cache: Option<Arc<dyn Cache>>) -> Self {
        Self {
            state: Arc::new(GossipState {
                info,
                cache,
                latest: AtomicU64::new(0),
                subs: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Validate one raw topic payload and deliver it on ACCEPT.
    pub fn handle_message(
        &self,
        validator: &BeaconValidator,
        data: &[u8],
        now: SystemTime,
    ) -> Verdict {
        self.state.handle_message(validator, data, now)
    }

    /// Highest round delivered to subscribers so far.
    pub fn latest_round(&self) -> u64 {
        self.state.latest.load(Ordering::SeqCst)
    }
}

impl GossipState {
    fn handle_message(
        &self,
        validator: &BeaconValidator,
        data: &[u8],
        now: SystemTime,
    ) -> Verdict {
        let verdict = validator.validate(data, now);
        if verdict != Verdict::Accept {
            return verdict;
        }
        // validate() proved the payload decodes
        let Ok(rand) = PublicRandResponse::decode(data) else {
            return Verdict::Reject;
        };
        let mut beacon: Beacon = rand.into();
        beacon.randomness = randomness_from_signature(&beacon.signature);
        self.dispatch(beacon);
        verdict
    }

    /// Deliver a verified beacon to every subscriber, dropping on full
    /// buffers and suppressing rounds at or below the highest seen.
    fn dispatch(&self, beacon: Beacon) {
        let latest = self.latest.load(Ordering::SeqCst);
        if beacon.round <= latest {
            debug!(
                round = beacon.round,
                latest, "gossip: dropping round at or below latest"
            );
            return;
        }
        self.latest.store(beacon.round, Ordering::SeqCst);

        if let Some(cache) = &self.cache {
            cache.add(beacon.round, &beacon);
        }

        let mut subs = self.subs.lock().unwrap();
        subs.retain(|id, tx| match tx.try_send(beacon.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::WATCH_DROPPED.with_label_values(&["gossip"]).inc();
                warn!(
                    subscriber = id,
                    round = beacon.round,
                    "gossip: notification dropped on a full subscriber buffer"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn subscribe(&self) -> BeaconStream {
        if self.closed.load(Ordering::SeqCst) {
            return futures::stream::empty().boxed();
        }
        let (tx, rx) = mpsc::channel(WATCH_BUFFER_SIZE);
        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        self.subs.lock().unwrap().insert(id, tx);
        ReceiverStream::new(rx).boxed()
    }
}

impl std::fmt::Debug for GossipClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipClient")
            .field("latest", &self.latest_round())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for GossipClient {
    async fn info(&self) -> Result<ChainInfo> {
        Ok(self.state.info.clone())
    }

    async fn get(&self, _round: u64) -> Result<Beacon> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Err(Error::Unsupported("get on a gossip client"))
    }

    async fn watch(&self) -> BeaconStream {
        self.state.subscribe()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.state.info.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.cancel.cancel();
        // closing the senders ends every subscriber stream
        self.state.subs.lock().unwrap().clear();
        Ok(())
    }

    fn name(&self) -> String {
        "gossip".to_string()
    }
}

#[async_trait]
impl Watcher for GossipClient {
    async fn watch(&self) -> BeaconStream {
        Client::watch(self).await
    }

    async fn close(&self) -> Result<()> {
        Client::close(self).await
    }
}
