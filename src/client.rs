//! The uniform client contract
//!
//! Every layer of the stack, from a single HTTP transport up to the
//! fully wired aggregating client, exposes the same small capability
//! set. Composition happens over `Arc<dyn Client>`.

use crate::beacon::Beacon;
use crate::chain::{unix_seconds, ChainInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lazy infinite sequence of beacons; ends when the producing client is
/// closed or its owning scope is cancelled.
pub type BeaconStream = Pin<Box<dyn Stream<Item = Beacon> + Send>>;

/// Capability set shared by every beacon client.
#[async_trait]
pub trait Client: std::fmt::Debug + Send + Sync {
    /// Chain descriptor this client serves. Cached at construction;
    /// never blocks on the network afterwards.
    async fn info(&self) -> Result<ChainInfo>;

    /// Beacon for `round`; `round == 0` means "latest available".
    ///
    /// A successful result always has round >= 1, and equals the
    /// requested round when one was given.
    async fn get(&self, round: u64) -> Result<Beacon>;

    /// New beacons as they become available.
    async fn watch(&self) -> BeaconStream;

    /// Latest round available at time `t`. Pure function of the cached
    /// chain info.
    fn round_at(&self, t: SystemTime) -> u64;

    /// Release resources, transitively closing wrapped clients.
    /// Idempotent; subsequent operations fail with [`Error::Closed`].
    async fn close(&self) -> Result<()>;

    /// Short name for logs and backend stats.
    fn name(&self) -> String;
}

/// A partial client supplying only the `watch` capability, bridged into
/// the stack by [`WatcherClient`]. Out-of-band sources such as the
/// gossip subscriber implement this.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// New beacons as they become available.
    async fn watch(&self) -> BeaconStream;

    /// Release resources held by the watcher.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Client that knows the chain but serves no randomness.
///
/// Base of [`WatcherClient`] and useful as a ranked info source.
#[derive(Debug, Clone)]
pub struct EmptyClient {
    info: ChainInfo,
}

impl EmptyClient {
    /// Client answering `info` and `round_at` from the given descriptor.
    pub fn new(info: ChainInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl Client for EmptyClient {
    async fn info(&self) -> Result<ChainInfo> {
        Ok(self.info.clone())
    }

    async fn get(&self, _round: u64) -> Result<Beacon> {
        Err(Error::Unsupported("get on an info-only client"))
    }

    async fn watch(&self) -> BeaconStream {
        futures::stream::empty().boxed()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.info.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        "empty".to_string()
    }
}

/// Couples an info-only client with an out-of-band [`Watcher`] so the
/// pair satisfies the full contract.
pub struct WatcherClient {
    base: EmptyClient,
    watcher: Arc<dyn Watcher>,
}

impl WatcherClient {
    /// Bridge `watcher` over the chain described by `info`.
    pub fn new(info: ChainInfo, watcher: Arc<dyn Watcher>) -> Self {
        Self {
            base: EmptyClient::new(info),
            watcher,
        }
    }
}

impl std::fmt::Debug for WatcherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for WatcherClient {
    async fn info(&self) -> Result<ChainInfo> {
        self.base.info().await
    }

    async fn get(&self, round: u64) -> Result<Beacon> {
        self.base.get(round).await
    }

    async fn watch(&self) -> BeaconStream {
        self.watcher.watch().await
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.base.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        self.watcher.close().await
    }

    fn name(&self) -> String {
        "watcher".to_string()
    }
}

/// Generalizes `watch` for transports that learn new values by asking
/// once per period.
///
/// Emits the current round immediately, sleeps to the next round
/// boundary, then polls on every period tick. The stream ends on
/// cancellation or when polling cannot be started.
pub fn polling_watcher(
    client: Arc<dyn Client>,
    info: ChainInfo,
    cancel: CancellationToken,
) -> BeaconStream {
    let (tx, rx) = mpsc::channel::<Beacon>(1);

    tokio::spawn(async move {
        let round = client.round_at(SystemTime::now());
        match client.get(round).await {
            Ok(beacon) => {
                if tx.send(beacon).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(client = %client.name(), %err, "poll: initial fetch failed");
                return;
            }
        }

        // Align to the next round boundary before ticking.
        let now = unix_seconds(SystemTime::now());
        let (_, next_time) = info.next_round(now);
        let wait = Duration::from_secs((next_time - now).max(0) as u64);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let mut ticker = tokio::time::interval(info.period());
        ticker.tick().await; // the first tick completes immediately
        loop {
            match client.get(client.round_at(SystemTime::now())).await {
                Ok(beacon) => {
                    if tx.send(beacon).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(client = %client.name(), %err, "poll: fetch failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
        }
    });

    ReceiverStream::new(rx).boxed()
}
