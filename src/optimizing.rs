//! Optimizing client
//!
//! Wraps a non-empty set of verified backends, ranks them by measured
//! round-trip time, races `get` against the fastest few and drives
//! `watch` from the single best source with failover. Passive backends
//! take part in watch aggregation but are never raced.

use crate::beacon::Beacon;
use crate::chain::ChainInfo;
use crate::client::{BeaconStream, Client};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-attempt timeout inside `get` races and speed tests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How many backends a `get` races concurrently.
const DEFAULT_CONCURRENCY: usize = 2;

/// Period between speed tests re-ranking the backends.
const DEFAULT_SPEED_TEST_INTERVAL: Duration = Duration::from_secs(300);

/// Delay before re-subscribing after a watch source closed or stalled.
const DEFAULT_WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Head start the current best backend gets over the next raced one.
const RACE_STAGGER: Duration = Duration::from_millis(250);

/// Fallback stall window when no chain info is available.
const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(45);

/// Tuning knobs for [`OptimizingClient`]; unset fields select defaults.
#[derive(Debug, Clone, Default)]
pub struct OptimizingOptions {
    /// Per-attempt timeout for `get` races and speed tests
    pub request_timeout: Option<Duration>,
    /// Number of backends raced concurrently on `get`
    pub concurrency: Option<usize>,
    /// Interval between periodic speed tests
    pub speed_test_interval: Option<Duration>,
    /// Delay before re-subscribing a closed or stalled watch source
    pub watch_retry_interval: Option<Duration>,
}

struct BackendStat {
    /// Measured round-trip time; `None` until the first speed test, and
    /// ranked worst until then. Failures record `Duration::MAX`.
    rtt: Option<Duration>,
    failures: u64,
    last_success: Option<Instant>,
}

struct Backend {
    client: Arc<dyn Client>,
    passive: AtomicBool,
}

/// Client racing and ranking redundant backends.
#[derive(Clone)]
pub struct OptimizingClient {
    state: Arc<OptState>,
}

struct OptState {
    backends: Vec<Backend>,
    stats: RwLock<Vec<BackendStat>>,
    request_timeout: Duration,
    concurrency: usize,
    speed_test_interval: Duration,
    watch_retry_interval: Duration,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl OptimizingClient {
    /// Wrap `clients`; fails on an empty set.
    pub fn new(clients: Vec<Arc<dyn Client>>, options: OptimizingOptions) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::NoBackends);
        }
        let stats = clients
            .iter()
            .map(|_| BackendStat {
                rtt: None,
                failures: 0,
                last_success: None,
            })
            .collect();
        let backends = clients
            .into_iter()
            .map(|client| Backend {
                client,
                passive: AtomicBool::new(false),
            })
            .collect();
        Ok(Self {
            state: Arc::new(OptState {
                backends,
                stats: RwLock::new(stats),
                request_timeout: options
                    .request_timeout
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                concurrency: options.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1),
                speed_test_interval: options
                    .speed_test_interval
                    .unwrap_or(DEFAULT_SPEED_TEST_INTERVAL),
                watch_retry_interval: options
                    .watch_retry_interval
                    .unwrap_or(DEFAULT_WATCH_RETRY_INTERVAL),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Exclude `client` from `get` races; its watch stream still feeds
    /// the merged output.
    pub fn mark_passive(&self, client: &Arc<dyn Client>) {
        for backend in &self.state.backends {
            if Arc::ptr_eq(&backend.client, client) {
                backend.passive.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Start the periodic speed test.
    pub fn start(&self) {
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                state.run_speed_test().await;
                tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    _ = tokio::time::sleep(state.speed_test_interval) => {}
                }
            }
        });
    }

    /// Run one speed test round immediately. Exposed for tests and for
    /// callers that want deterministic ranking before the first `get`.
    pub async fn run_speed_test(&self) {
        self.state.run_speed_test().await;
    }

    /// Whether every active backend has a measured round-trip time.
    pub fn speed_tested(&self) -> bool {
        let stats = self.state.stats.read().unwrap();
        self.state
            .backends
            .iter()
            .zip(stats.iter())
            .filter(|(b, _)| !b.passive.load(Ordering::SeqCst))
            .all(|(_, s)| s.rtt.is_some())
    }

    /// Health snapshot of every backend, in original order.
    pub fn backend_status(&self) -> Vec<BackendStatus> {
        let stats = self.state.stats.read().unwrap();
        self.state
            .backends
            .iter()
            .zip(stats.iter())
            .map(|(backend, stat)| BackendStatus {
                name: backend.client.name(),
                rtt: stat.rtt,
                failures: stat.failures,
                last_success: stat.last_success,
                passive: backend.passive.load(Ordering::SeqCst),
            })
            .collect()
    }
}

/// Point-in-time health of one backend.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    /// Backend name as reported by its client
    pub name: String,
    /// Measured round-trip time; `None` before the first speed test
    pub rtt: Option<Duration>,
    /// Failed requests observed
    pub failures: u64,
    /// Instant of the last successful request
    pub last_success: Option<Instant>,
    /// Whether the backend is excluded from `get` races
    pub passive: bool,
}

impl OptState {
    async fn run_speed_test(&self) {
        let checks: Vec<_> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.passive.load(Ordering::SeqCst))
            .map(|(index, backend)| {
                let client = backend.client.clone();
                let timeout = self.request_timeout;
                async move {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(timeout, client.get(1)).await;
                    let rtt = match outcome {
                        Ok(Ok(_)) => Some(started.elapsed()),
                        Ok(Err(err)) => {
                            debug!(backend = %client.name(), %err, "speed test failed");
                            None
                        }
                        Err(_) => {
                            debug!(backend = %client.name(), "speed test timed out");
                            None
                        }
                    };
                    (index, rtt)
                }
            })
            .collect();

        let results = futures::future::join_all(checks).await;
        let mut stats = self.stats.write().unwrap();
        for (index, rtt) in results {
            match rtt {
                Some(rtt) => {
                    stats[index].rtt = Some(rtt);
                    stats[index].last_success = Some(Instant::now());
                }
                None => {
                    stats[index].rtt = Some(Duration::MAX);
                    stats[index].failures += 1;
                }
            }
        }
    }

    /// Backends ordered fastest first; unknown RTT ranks last, ties keep
    /// the original ordering.
    fn ranked(&self, include_passive: bool) -> Vec<(usize, Arc<dyn Client>)> {
        let stats = self.stats.read().unwrap();
        let mut order: Vec<(usize, Arc<dyn Client>, (u8, Duration))> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| include_passive || !b.passive.load(Ordering::SeqCst))
            .map(|(index, backend)| {
                let key = match stats[index].rtt {
                    Some(rtt) => (0u8, rtt),
                    None => (1u8, Duration::ZERO),
                };
                (index, backend.client.clone(), key)
            })
            .collect();
        order.sort_by_key(|(index, _, key)| (*key, *index));
        order
            .into_iter()
            .map(|(index, client, _)| (index, client))
            .collect()
    }

    fn record_success(&self, index: usize, elapsed: Duration) {
        let mut stats = self.stats.write().unwrap();
        let stat = &mut stats[index];
        stat.rtt = match stat.rtt {
            Some(old) if old != Duration::MAX => Some((old + elapsed) / 2),
            _ => Some(elapsed),
        };
        stat.last_success = Some(Instant::now());
    }

    fn record_failure(&self, index: usize) {
        let mut stats = self.stats.write().unwrap();
        stats[index].failures += 1;
        stats[index].rtt = Some(Duration::MAX);
    }

}

/// Race `get` across the ranked backends with staggered starts; the
/// first verified success wins and the losers are dropped.
async fn race_get(state: Arc<OptState>, round: u64) -> Result<Beacon> {
    let mut candidates = state.ranked(false);
    if candidates.is_empty() {
        // only passive backends exist; let them answer
        candidates = state.ranked(true);
    }

    let mut queue = candidates.into_iter();
    let mut in_flight = FuturesUnordered::new();
    for (slot, (index, client)) in queue.by_ref().take(state.concurrency).enumerate() {
        in_flight.push(attempt(
            state.clone(),
            index,
            client,
            round,
            RACE_STAGGER * slot as u32,
        ));
    }

    let mut last_err = None;
    loop {
        let next = tokio::select! {
            _ = state.cancel.cancelled() => return Err(Error::Closed),
            next = in_flight.next() => next,
        };
        let Some((index, outcome)) = next else { break };
        match outcome {
            Ok((beacon, elapsed)) => {
                state.record_success(index, elapsed);
                return Ok(beacon);
            }
            Err(err) => {
                state.record_failure(index);
                if !err.is_retryable() {
                    return Err(err);
                }
                debug!(%err, "get attempt failed, falling through");
                last_err = Some(err);
                if let Some((index, client)) = queue.next() {
                    in_flight.push(attempt(
                        state.clone(),
                        index,
                        client,
                        round,
                        Duration::ZERO,
                    ));
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::NotAvailable("no usable backend".into())))
}

async fn attempt(
    state: Arc<OptState>,
    index: usize,
    client: Arc<dyn Client>,
    round: u64,
    delay: Duration,
) -> (usize, Result<(Beacon, Duration)>) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let started = Instant::now();
    match tokio::time::timeout(state.request_timeout, client.get(round)).await {
        Ok(Ok(beacon)) => (index, Ok((beacon, started.elapsed()))),
        Ok(Err(err)) => (index, Err(err)),
        Err(_) => (
            index,
            Err(Error::Network(format!("{} timed out", client.name()))),
        ),
    }
}

/// Watch plumbing: one task per passive backend, one task driving the
/// best active backend, and a merge loop de-duplicating by round.
async fn watch_manager(state: Arc<OptState>, out: mpsc::Sender<Beacon>, stall: Duration) {
    let (merge_tx, mut merge_rx) = mpsc::channel::<Beacon>(32);

    for (index, backend) in state.backends.iter().enumerate() {
        if backend.passive.load(Ordering::SeqCst) {
            tokio::spawn(passive_watch(
                state.clone(),
                index,
                merge_tx.clone(),
            ));
        }
    }
    tokio::spawn(active_watch(state.clone(), merge_tx, stall));

    let mut latest = 0u64;
    loop {
        let item = tokio::select! {
            _ = state.cancel.cancelled() => return,
            item = merge_rx.recv() => item,
        };
        let Some(beacon) = item else { return };
        if beacon.round <= latest {
            debug!(round = beacon.round, latest, "watch: discarding duplicate round");
            continue;
        }
        latest = beacon.round;
        if out.send(beacon).await.is_err() {
            return;
        }
    }
}

/// Drain one passive backend forever, re-opening closed streams.
async fn passive_watch(state: Arc<OptState>, index: usize, merge_tx: mpsc::Sender<Beacon>) {
    let client = state.backends[index].client.clone();
    loop {
        let mut stream = client.watch().await;
        loop {
            let item = tokio::select! {
                _ = state.cancel.cancelled() => return,
                item = stream.next() => item,
            };
            let Some(beacon) = item else { break };
            if merge_tx.send(beacon).await.is_err() {
                return;
            }
        }
        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = tokio::time::sleep(state.watch_retry_interval) => {}
        }
    }
}

/// Subscribe to the best-ranked active backend; on closure or one stall
/// window of silence, penalize it and promote the next best.
async fn active_watch(state: Arc<OptState>, merge_tx: mpsc::Sender<Beacon>, stall: Duration) {
    loop {
        let Some((index, client)) = state.ranked(false).into_iter().next() else {
            return;
        };
        debug!(backend = %client.name(), "watch: following best backend");

        let mut stream = client.watch().await;
        loop {
            let item = tokio::select! {
                _ = state.cancel.cancelled() => return,
                item = tokio::time::timeout(stall, stream.next()) => item,
            };
            match item {
                Ok(Some(beacon)) => {
                    if merge_tx.send(beacon).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!(backend = %client.name(), "watch: source closed");
                    break;
                }
                Err(_) => {
                    warn!(backend = %client.name(), "watch: source stalled, promoting next");
                    break;
                }
            }
        }
        state.record_failure(index);

        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = tokio::time::sleep(state.watch_retry_interval) => {}
        }
    }
}

impl std::fmt::Debug for OptimizingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizingClient")
            .field("backends", &self.state.backends.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for OptimizingClient {
    async fn info(&self) -> Result<ChainInfo> {
        let mut last_err = None;
        for backend in &self.state.backends {
            match backend.client.info().await {
                Ok(info) => return Ok(info),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::NotAvailable("no backend".into())))
    }

    async fn get(&self, round: u64) -> Result<Beacon> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        race_get(self.state.clone(), round).await
    }

    async fn watch(&self) -> BeaconStream {
        if self.state.closed.load(Ordering::SeqCst) {
            return futures::stream::empty().boxed();
        }
        let stall = match self.info().await {
            Ok(info) => info.period() + info.period() / 2,
            Err(_) => DEFAULT_STALL_WINDOW,
        };
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(watch_manager(self.state.clone(), tx, stall));
        ReceiverStream::new(rx).boxed()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.state.backends[0].client.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.cancel.cancel();
        let mut result = Ok(());
        for backend in &self.state.backends {
            if let Err(err) = backend.client.close().await {
                result = Err(err);
            }
        }
        result
    }

    fn name(&self) -> String {
        format!("optimizing({})", self.state.backends.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_beacon, test_info, MockClient};

    fn options() -> OptimizingOptions {
        OptimizingOptions {
            request_timeout: Some(Duration::from_secs(5)),
            concurrency: Some(2),
            speed_test_interval: Some(Duration::from_secs(300)),
            watch_retry_interval: Some(Duration::from_millis(1)),
        }
    }

    #[test]
    fn requires_at_least_one_backend() {
        assert!(matches!(
            OptimizingClient::new(Vec::new(), OptimizingOptions::default()).unwrap_err(),
            Error::NoBackends
        ));
    }

    #[tokio::test]
    async fn speed_test_ranks_the_fast_backend_first() {
        let slow = Arc::new(
            MockClient::with_rounds(0, 5).with_delay(Duration::from_millis(100)),
        );
        let fast =
            Arc::new(MockClient::with_rounds(5, 8).with_delay(Duration::from_millis(1)));
        let clients: Vec<Arc<dyn Client>> = vec![slow.clone(), fast.clone()];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        oc.run_speed_test().await;
        assert!(oc.speed_tested());

        // speed test consumed one result from each; the fast backend
        // serves the race from here on
        let beacon = oc.get(0).await.unwrap();
        assert_eq!(beacon.round, 6);
    }

    #[tokio::test]
    async fn get_falls_through_when_the_fast_backend_runs_dry() {
        let slow = Arc::new(
            MockClient::with_rounds(0, 5).with_delay(Duration::from_millis(30)),
        );
        let fast = Arc::new(MockClient::with_rounds(5, 8));
        let clients: Vec<Arc<dyn Client>> = vec![slow.clone(), fast.clone()];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        oc.run_speed_test().await;

        assert_eq!(oc.get(0).await.unwrap().round, 6);
        assert_eq!(oc.get(0).await.unwrap().round, 7);
        // fast is exhausted and errors; the race falls through to slow
        assert_eq!(oc.get(0).await.unwrap().round, 1);
        assert_eq!(oc.get(0).await.unwrap().round, 2);
    }

    #[tokio::test]
    async fn speed_test_penalizes_an_erroring_backend() {
        let dead = Arc::new(MockClient::with_rounds(0, 0)); // always errors
        let alive = Arc::new(MockClient::with_rounds(1, 50));
        let clients: Vec<Arc<dyn Client>> = vec![dead.clone(), alive.clone()];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        oc.run_speed_test().await;

        // the healthy backend is ranked first despite original ordering
        let ranked = oc.state.ranked(false);
        assert_eq!(ranked[0].0, 1);

        let status = oc.backend_status();
        assert_eq!(status[0].failures, 1);
        assert!(status[0].last_success.is_none());
        assert!(status[1].last_success.is_some());
    }

    #[tokio::test]
    async fn verification_failures_are_not_masked_by_other_backends() {
        #[derive(Debug)]
        struct Malicious;

        #[async_trait]
        impl Client for Malicious {
            async fn info(&self) -> Result<ChainInfo> {
                Ok(test_info())
            }
            async fn get(&self, _round: u64) -> Result<Beacon> {
                Err(Error::InvalidBeacon("bad signature".into()))
            }
            async fn watch(&self) -> BeaconStream {
                futures::stream::empty().boxed()
            }
            fn round_at(&self, _t: SystemTime) -> u64 {
                0
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
            fn name(&self) -> String {
                "malicious".to_string()
            }
        }

        let clients: Vec<Arc<dyn Client>> =
            vec![Arc::new(Malicious), Arc::new(MockClient::with_rounds(1, 10))];
        let oc = OptimizingClient::new(clients, options()).unwrap();

        // without a speed test the first backend keeps its ordering; the
        // verification error must surface instead of falling through
        let err = oc.get(4).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBeacon(_)));
    }

    #[tokio::test]
    async fn watch_merges_and_deduplicates_by_round() {
        let (active, active_tx) = MockClient::with_rounds(0, 1).with_watch_channel();
        let clients: Vec<Arc<dyn Client>> = vec![Arc::new(active)];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        oc.run_speed_test().await;

        let mut stream = oc.watch().await;
        active_tx.send(test_beacon(1)).await.unwrap();
        active_tx.send(test_beacon(2)).await.unwrap();
        active_tx.send(test_beacon(2)).await.unwrap();
        active_tx.send(test_beacon(3)).await.unwrap();

        assert_eq!(stream.next().await.unwrap().round, 1);
        assert_eq!(stream.next().await.unwrap().round, 2);
        // the duplicate round 2 was discarded
        assert_eq!(stream.next().await.unwrap().round, 3);
    }

    #[tokio::test]
    async fn watch_reopens_a_backend_that_keeps_closing() {
        // every watch call yields one round then closes
        let batches = (1u64..=5).map(|r| vec![test_beacon(r)]).collect();
        let flaky = Arc::new(
            MockClient::with_rounds(0, 1).with_watch_batches(batches),
        );
        let clients: Vec<Arc<dyn Client>> = vec![flaky.clone()];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        oc.run_speed_test().await;

        let mut stream = oc.watch().await;
        for expected in 1u64..=4 {
            assert_eq!(stream.next().await.unwrap().round, expected);
        }
        assert!(flaky.watches() >= 4);
    }

    #[tokio::test]
    async fn passive_backends_feed_watch_but_not_get() {
        let (passive, passive_tx) = MockClient::with_info(test_info()).with_watch_channel();
        let passive: Arc<dyn Client> = Arc::new(passive);
        let active = Arc::new(MockClient::with_rounds(1, 2));
        let clients: Vec<Arc<dyn Client>> = vec![active.clone(), passive.clone()];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        oc.mark_passive(&passive);
        oc.run_speed_test().await;

        // a passive-only round arrives through the merged stream
        let mut stream = oc.watch().await;
        passive_tx.send(test_beacon(9)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().round, 9);

        // gets never touch the passive backend
        let gets_before = active.gets();
        let _ = oc.get(0).await;
        assert!(active.gets() > gets_before);
    }

    #[tokio::test]
    async fn close_reaches_every_backend_and_ends_operations() {
        let a = Arc::new(MockClient::with_rounds(1, 3));
        let b = Arc::new(MockClient::with_rounds(1, 3));
        let clients: Vec<Arc<dyn Client>> = vec![a.clone(), b.clone()];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        oc.start();

        oc.close().await.unwrap();
        oc.close().await.unwrap();
        assert_eq!(a.closes(), 2);
        assert_eq!(b.closes(), 2);
        assert!(matches!(oc.get(1).await.unwrap_err(), Error::Closed));
    }

    #[tokio::test]
    async fn info_comes_from_the_first_answering_backend() {
        let info = test_info();
        let silent = Arc::new(MockClient::with_rounds(1, 2)); // no info
        let informed = Arc::new(MockClient::with_info(info.clone()));
        let clients: Vec<Arc<dyn Client>> = vec![silent, informed];

        let oc = OptimizingClient::new(clients, options()).unwrap();
        assert_eq!(oc.info().await.unwrap(), info);
    }
}
