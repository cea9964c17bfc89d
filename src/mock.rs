//! Test doubles: scripted clients and a self-signing beacon chain.

use crate::beacon::Beacon;
use crate::chain::{ChainInfo, ChainMetadata};
use crate::client::{BeaconStream, Client, Watcher};
use crate::error::{Error, Result};
use crate::scheme::{randomness_from_signature, Scheme};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Scripted client: `get` pops pre-loaded beacons, `watch` drains them
/// or yields from an injected channel.
pub struct MockClient {
    info: Option<ChainInfo>,
    results: Mutex<VecDeque<Beacon>>,
    /// Serve `get(round)` by scanning for the matching round instead of
    /// popping in order.
    strict_rounds: bool,
    delay: Option<Duration>,
    watch_rx: Mutex<Option<mpsc::Receiver<Beacon>>>,
    /// Each `watch` call consumes one batch, yields it, then ends the
    /// stream. Lets tests model upstreams that keep closing.
    watch_batches: Mutex<VecDeque<Vec<Beacon>>>,
    gets: AtomicUsize,
    watches: AtomicUsize,
    closes: AtomicUsize,
}

impl MockClient {
    fn empty() -> Self {
        Self {
            info: None,
            results: Mutex::new(VecDeque::new()),
            strict_rounds: false,
            delay: None,
            watch_rx: Mutex::new(None),
            watch_batches: Mutex::new(VecDeque::new()),
            gets: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Client pre-loaded with structural beacons for rounds `from..to`.
    pub fn with_rounds(from: u64, to: u64) -> Self {
        let mut c = Self::empty();
        c.results = Mutex::new((from..to).map(test_beacon).collect());
        c
    }

    /// Client serving the given beacons in order, with chain info.
    pub fn with_beacons(info: ChainInfo, beacons: Vec<Beacon>) -> Self {
        let mut c = Self::empty();
        c.info = Some(info);
        c.results = Mutex::new(beacons.into());
        c
    }

    /// Client answering `get(round)` by round lookup, with chain info.
    pub fn strict_rounds(info: ChainInfo, beacons: Vec<Beacon>) -> Self {
        let mut c = Self::with_beacons(info, beacons);
        c.strict_rounds = true;
        c
    }

    /// Info-only client.
    pub fn with_info(info: ChainInfo) -> Self {
        let mut c = Self::empty();
        c.info = Some(info);
        c
    }

    /// Delay every `get` response by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Route `watch` through an externally fed channel.
    pub fn with_watch_channel(mut self) -> (Self, mpsc::Sender<Beacon>) {
        let (tx, rx) = mpsc::channel(16);
        self.watch_rx = Mutex::new(Some(rx));
        (self, tx)
    }

    /// Script successive `watch` calls: each call yields one batch then
    /// closes its stream.
    pub fn with_watch_batches(mut self, batches: Vec<Vec<Beacon>>) -> Self {
        self.watch_batches = Mutex::new(batches.into());
        self
    }

    /// Number of `get` calls served so far.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `watch` calls served so far.
    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    /// Number of `close` calls observed.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for MockClient {
    async fn info(&self) -> Result<ChainInfo> {
        self.info
            .clone()
            .ok_or_else(|| Error::Network("mock: no chain info".into()))
    }

    async fn get(&self, round: u64) -> Result<Beacon> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let beacon = {
            let mut results = self.results.lock().unwrap();
            if self.strict_rounds {
                results
                    .iter()
                    .find(|b| b.round == round)
                    .cloned()
                    .ok_or_else(|| Error::Network(format!("mock: no result for round {round}")))?
            } else {
                results
                    .pop_front()
                    .ok_or_else(|| Error::Network("mock: no result available".into()))?
            }
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(beacon)
    }

    async fn watch(&self) -> BeaconStream {
        self.watches.fetch_add(1, Ordering::SeqCst);
        if let Some(rx) = self.watch_rx.lock().unwrap().take() {
            return ReceiverStream::new(rx).boxed();
        }
        if let Some(batch) = self.watch_batches.lock().unwrap().pop_front() {
            return futures::stream::iter(batch).boxed();
        }
        let drained: Vec<Beacon> = self.results.lock().unwrap().drain(..).collect();
        futures::stream::iter(drained).boxed()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.info.as_ref().map(|i| i.round_at(t)).unwrap_or(0)
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[async_trait]
impl Watcher for MockClient {
    async fn watch(&self) -> BeaconStream {
        Client::watch(self).await
    }
}

/// Structurally valid beacon for `round` with a deterministic filler
/// signature. Not cryptographically verifiable; use [`TestChain`] for
/// that.
pub fn test_beacon(round: u64) -> Beacon {
    let signature: Vec<u8> = round.to_be_bytes().repeat(6);
    Beacon {
        round,
        randomness: randomness_from_signature(&signature),
        signature,
        previous_signature: Vec::new(),
    }
}

/// Chain info for a fictional unchained test chain.
pub fn test_info() -> ChainInfo {
    let mut info = ChainInfo {
        public_key: vec![0x42; 96],
        period: 3,
        genesis_time: 1_600_000_000,
        hash: Vec::new(),
        group_hash: vec![0x24; 32],
        scheme_id: "bls-unchained-g1-rfc9380".to_string(),
        metadata: ChainMetadata {
            beacon_id: "test".to_string(),
        },
        genesis_seed: vec![0x51; 32],
    };
    info.hash = info.chain_hash();
    info
}

enum TestKey {
    MinPk(blst::min_pk::SecretKey),
    MinSig(blst::min_sig::SecretKey),
}

/// A beacon chain with a real BLS key pair, producing beacons that pass
/// scheme verification.
pub struct TestChain {
    scheme: Scheme,
    key: TestKey,
    genesis_seed: Vec<u8>,
    genesis_time: i64,
    period: u64,
}

impl TestChain {
    /// Fresh chain for `scheme` with a deterministic key.
    pub fn new(scheme: Scheme) -> Self {
        Self::with_seed(scheme, [7u8; 32])
    }

    /// Chain whose key material derives from `ikm`, so two chains with
    /// different seeds produce mutually invalid signatures.
    pub fn with_seed(scheme: Scheme, ikm: [u8; 32]) -> Self {
        let key = if scheme.signature_on_g1() {
            TestKey::MinSig(
                blst::min_sig::SecretKey::key_gen(&ikm, &[]).expect("test key generation"),
            )
        } else {
            TestKey::MinPk(
                blst::min_pk::SecretKey::key_gen(&ikm, &[]).expect("test key generation"),
            )
        };
        Self {
            scheme,
            key,
            genesis_seed: ikm.to_vec(),
            genesis_time: 1_600_000_000,
            period: 3,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn public_key(&self) -> Vec<u8> {
        match &self.key {
            TestKey::MinPk(sk) => sk.sk_to_pk().to_bytes().to_vec(),
            TestKey::MinSig(sk) => sk.sk_to_pk().to_bytes().to_vec(),
        }
    }

    pub fn genesis_seed(&self) -> Vec<u8> {
        self.genesis_seed.clone()
    }

    /// Chain descriptor matching this chain's key and scheme.
    pub fn info(&self) -> ChainInfo {
        let mut info = ChainInfo {
            public_key: self.public_key(),
            period: self.period,
            genesis_time: self.genesis_time,
            hash: Vec::new(),
            group_hash: vec![0x24; 32],
            scheme_id: self.scheme.id().to_string(),
            metadata: ChainMetadata {
                beacon_id: "test".to_string(),
            },
            genesis_seed: self.genesis_seed.clone(),
        };
        info.hash = info.chain_hash();
        info
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        match &self.key {
            TestKey::MinPk(sk) => sk.sign(message, self.scheme.dst(), &[]).to_bytes().to_vec(),
            TestKey::MinSig(sk) => sk.sign(message, self.scheme.dst(), &[]).to_bytes().to_vec(),
        }
    }

    /// Signature for `round`, chaining from the genesis seed when the
    /// scheme requires it.
    pub fn signature_of(&self, round: u64) -> Vec<u8> {
        if !self.scheme.is_chained() {
            let message = self.scheme.beacon_message(round, &[]).expect("message");
            return self.sign(&message);
        }
        let mut previous = self.genesis_seed.clone();
        let mut signature = Vec::new();
        for r in 1..=round {
            let message = self.scheme.beacon_message(r, &previous).expect("message");
            signature = self.sign(&message);
            previous = signature.clone();
        }
        signature
    }

    /// Fully populated, verifiable beacon for `round`.
    pub fn beacon(&self, round: u64) -> Beacon {
        let signature = self.signature_of(round);
        let previous_signature = if self.scheme.is_chained() {
            if round == 1 {
                self.genesis_seed.clone()
            } else {
                self.signature_of(round - 1)
            }
        } else {
            Vec::new()
        };
        Beacon {
            round,
            randomness: randomness_from_signature(&signature),
            signature,
            previous_signature,
        }
    }
}
