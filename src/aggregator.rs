//! Watch aggregation
//!
//! Owns a single upstream subscription and fans it out to any number of
//! subscribers, each behind a bounded buffer. Delivery is best-effort: a
//! full subscriber drops the item while the others proceed. Auto-watch
//! opens the upstream at start so rounds flow into the cache even with
//! no external subscribers, and a retry delay re-opens an upstream that
//! closed.

use crate::beacon::Beacon;
use crate::chain::ChainInfo;
use crate::client::{BeaconStream, Client};
use crate::error::{Error, Result};
use crate::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bound of each subscriber's delivery buffer.
pub const SUBSCRIBER_BUFFER: usize = 100;

/// Re-open delay applied when no explicit retry setting was given.
pub const DEFAULT_AUTO_WATCH_RETRY: Duration = Duration::from_secs(10);

/// Fan-out layer multiplexing one upstream `watch` to many subscribers.
#[derive(Clone)]
pub struct WatchAggregator {
    state: Arc<AggState>,
}

struct AggState {
    client: Arc<dyn Client>,
    /// Out-of-band source drained so its beacons keep flowing into the
    /// cache when auto-watch is off.
    passive: Option<Arc<dyn Client>>,
    auto_watch: bool,
    /// `None` disables re-opening a closed upstream.
    retry: Option<Duration>,
    subs: Mutex<HashMap<u64, mpsc::Sender<Beacon>>>,
    next_sub: AtomicU64,
    producer_running: AtomicBool,
    producer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    dropped: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl WatchAggregator {
    /// Aggregate over `client`, optionally draining `passive`.
    pub fn new(
        client: Arc<dyn Client>,
        passive: Option<Arc<dyn Client>>,
        auto_watch: bool,
        retry: Option<Duration>,
    ) -> Self {
        Self {
            state: Arc::new(AggState {
                client,
                passive,
                auto_watch,
                retry,
                subs: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(0),
                producer_running: AtomicBool::new(false),
                producer: Mutex::new(None),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Begin background work: the upstream subscription when auto-watch
    /// is on, otherwise a drain of the passive source.
    pub fn start(&self) {
        if self.state.auto_watch {
            ensure_producer(&self.state);
        } else if self.state.passive.is_some() {
            let state = self.state.clone();
            tokio::spawn(async move {
                let Some(passive) = state.passive.clone() else {
                    return;
                };
                loop {
                    let mut stream = passive.watch().await;
                    loop {
                        let item = tokio::select! {
                            _ = state.cancel.cancelled() => return,
                            item = stream.next() => item,
                        };
                        // drained only to keep the source flowing
                        if item.is_none() {
                            break;
                        }
                    }
                    let delay = state.retry.unwrap_or(DEFAULT_AUTO_WATCH_RETRY);
                    tokio::select! {
                        _ = state.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            });
        }
    }

    /// Beacons dropped so far on full subscriber buffers.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::SeqCst)
    }
}

/// Spawn the single upstream producer unless it is already running.
fn ensure_producer(state: &Arc<AggState>) {
    if state.producer_running.swap(true, Ordering::SeqCst) {
        return;
    }
    let handle = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut latest = 0u64;
            loop {
                let mut stream = state.client.watch().await;
                loop {
                    let item = tokio::select! {
                        _ = state.cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    let Some(beacon) = item else { break };
                    if beacon.round <= latest {
                        continue;
                    }
                    latest = beacon.round;
                    state.distribute(beacon);
                }
                debug!("aggregator: upstream closed");
                let Some(delay) = state.retry else { return };
                tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    };
    *state.producer.lock().unwrap() = Some(handle);
}

impl AggState {
    /// Best-effort delivery to every subscriber.
    fn distribute(&self, beacon: Beacon) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|id, tx| match tx.try_send(beacon.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                metrics::WATCH_DROPPED
                    .with_label_values(&["aggregator"])
                    .inc();
                warn!(
                    subscriber = id,
                    round = beacon.round,
                    "aggregator: dropping beacon for a full subscriber"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl std::fmt::Debug for WatchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchAggregator")
            .field("auto_watch", &self.state.auto_watch)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for WatchAggregator {
    async fn info(&self) -> Result<ChainInfo> {
        self.state.client.info().await
    }

    async fn get(&self, round: u64) -> Result<Beacon> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.state.client.get(round).await
    }

    async fn watch(&self) -> BeaconStream {
        if self.state.closed.load(Ordering::SeqCst) {
            return futures::stream::empty().boxed();
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.state.next_sub.fetch_add(1, Ordering::SeqCst);
        self.state.subs.lock().unwrap().insert(id, tx);
        ensure_producer(&self.state);
        ReceiverStream::new(rx).boxed()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.state.client.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        let first_close = !self.state.closed.swap(true, Ordering::SeqCst);
        self.state.cancel.cancel();
        self.state.subs.lock().unwrap().clear();

        // wait for the producer so no delivery races the close
        let handle = self.state.producer.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if !first_close {
            return Ok(());
        }
        let mut result = Ok(());
        if let Some(passive) = &self.state.passive {
            result = passive.close().await;
        }
        self.state.client.close().await.and(result)
    }

    fn name(&self) -> String {
        format!("{}+aggregator", self.state.client.name())
    }
}
