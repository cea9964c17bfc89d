//! Client assembly
//!
//! A `Config` gathers backends and trust options, then `build` wires the
//! stack: transports → verifiers → optimizer → cache → aggregator, with
//! each verifier's indirect backend pointed at the caching layer so
//! trust walks are served from the cache.

use crate::aggregator::{WatchAggregator, DEFAULT_AUTO_WATCH_RETRY};
use crate::beacon::Beacon;
use crate::cache::{new_cache, CachingClient};
use crate::chain::ChainInfo;
use crate::client::{Client, Watcher, WatcherClient};
use crate::error::{Error, Result};
use crate::metrics::register_metrics;
use crate::optimizing::{OptimizingClient, OptimizingOptions};
use crate::scheme::Scheme;
use crate::verifying::VerifyingClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default capacity of the beacon cache.
pub const DEFAULT_CACHE_SIZE: usize = 32;

/// Default timeout for fetching chain info during construction.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Constructor for an out-of-band beacon source, invoked once chain
/// info is known.
pub type WatcherCtor =
    Box<dyn FnOnce(&ChainInfo, Arc<dyn crate::cache::Cache>) -> Result<Arc<dyn Watcher>> + Send>;

/// Configuration record assembled by the builder methods and consumed
/// by [`Config::build`]. Rejected combinations fail at construction,
/// not at first use.
pub struct Config {
    clients: Vec<Arc<dyn Client>>,
    watcher: Option<WatcherCtor>,
    chain_hash: Option<Vec<u8>>,
    chain_info: Option<ChainInfo>,
    previous_result: Option<Beacon>,
    full_verify: bool,
    insecure: bool,
    auto_watch: bool,
    auto_watch_retry: Option<Duration>,
    cache_size: usize,
    setup_timeout: Duration,
    optimizing: OptimizingOptions,
    metrics_registry: Option<prometheus::Registry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clients: Vec::new(),
            watcher: None,
            chain_hash: None,
            chain_info: None,
            previous_result: None,
            full_verify: false,
            insecure: false,
            auto_watch: false,
            auto_watch_retry: Some(DEFAULT_AUTO_WATCH_RETRY),
            cache_size: DEFAULT_CACHE_SIZE,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            optimizing: OptimizingOptions::default(),
            metrics_registry: None,
        }
    }
}

impl Config {
    /// Start an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one transport backend.
    pub fn with_client(mut self, client: Arc<dyn Client>) -> Self {
        self.clients.push(client);
        self
    }

    /// Add a set of transport backends.
    pub fn from_clients(mut self, clients: Vec<Arc<dyn Client>>) -> Self {
        self.clients.extend(clients);
        self
    }

    /// Bind the root of trust by chain hash; chain parameters are
    /// fetched from the backends during construction.
    pub fn with_chain_hash(mut self, hash: Vec<u8>) -> Self {
        self.chain_hash = Some(hash);
        self
    }

    /// Bind a full root of trust, skipping the bootstrap fetch.
    pub fn with_chain_info(mut self, info: ChainInfo) -> Self {
        self.chain_info = Some(info);
        self
    }

    /// Permit operation without a verified root of trust; verification
    /// becomes a no-op.
    pub fn insecurely(mut self) -> Self {
        self.insecure = true;
        self
    }

    /// Seed the verifiers' point of trust with a previously verified
    /// beacon.
    pub fn with_trusted_result(mut self, beacon: Beacon) -> Self {
        match &self.previous_result {
            Some(existing) if existing.round > beacon.round => {
                warn!(
                    have = existing.round,
                    offered = beacon.round,
                    "refusing to replace trusted result with an earlier round"
                );
            }
            _ => self.previous_result = Some(beacon),
        }
        self
    }

    /// Verify chained schemes all the way back to a trusted round.
    pub fn with_full_chain_verification(mut self) -> Self {
        self.full_verify = true;
        self
    }

    /// Capacity of the cache layer; 0 disables caching.
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Open the upstream watch at construction so new rounds land in
    /// the cache before anyone asks.
    pub fn with_auto_watch(mut self) -> Self {
        self.auto_watch = true;
        self
    }

    /// Delay before a closed upstream watch is re-opened; `None`
    /// disables retrying.
    pub fn with_auto_watch_retry(mut self, retry: Option<Duration>) -> Self {
        self.auto_watch_retry = retry;
        self
    }

    /// Supply an out-of-band beacon source (e.g. the gossip client); it
    /// joins the stack as a passive backend.
    pub fn with_watcher(mut self, ctor: WatcherCtor) -> Self {
        self.watcher = Some(ctor);
        self
    }

    /// Timeout for the chain-info bootstrap.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Tuning for the optimizing layer.
    pub fn with_optimizing_options(mut self, options: OptimizingOptions) -> Self {
        self.optimizing = options;
        self
    }

    /// Register client metrics into `registry`.
    pub fn with_metrics(mut self, registry: prometheus::Registry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Assemble the full client stack.
    pub async fn build(self) -> Result<Arc<dyn Client>> {
        let Config {
            mut clients,
            watcher,
            chain_hash,
            chain_info,
            previous_result,
            full_verify,
            insecure,
            auto_watch,
            auto_watch_retry,
            cache_size,
            setup_timeout,
            optimizing,
            metrics_registry,
        } = self;

        if !insecure && chain_hash.is_none() && chain_info.is_none() {
            return Err(Error::NoRootOfTrust);
        }
        if clients.is_empty() && watcher.is_none() {
            return Err(Error::NoBackends);
        }
        if let (Some(hash), Some(info)) = (&chain_hash, &chain_info) {
            info.verify_chain_hash(hash)?;
        }

        if let Some(registry) = &metrics_registry {
            // registries may be shared across clients; duplicates are fine
            let _ = register_metrics(registry);
        }

        // freeze the root of trust, fetching it if absent
        let info = match chain_info {
            Some(info) => info,
            None => bootstrap_info(&clients, setup_timeout).await?,
        };
        info.validate()?;
        if let Some(hash) = &chain_hash {
            info.verify_chain_hash(hash)?;
        }

        let cache = new_cache(cache_size);

        // the out-of-band watcher joins as one more backend
        let mut watcher_client: Option<Arc<dyn Client>> = None;
        if let Some(ctor) = watcher {
            let w = ctor(&info, cache.clone())?;
            let wc: Arc<dyn Client> = Arc::new(WatcherClient::new(info.clone(), w));
            watcher_client = Some(wc.clone());
            clients.push(wc);
        }

        // verification sits closest to the wire; insecure mode skips it
        let mut verifiers: Vec<VerifyingClient> = Vec::new();
        let mut passive_handle: Option<Arc<dyn Client>> = None;
        let backends: Vec<Arc<dyn Client>> = if insecure {
            passive_handle = watcher_client.clone();
            clients
        } else {
            let scheme = Scheme::from_id(&info.scheme_id)?;
            clients
                .into_iter()
                .map(|source| {
                    let is_watcher = watcher_client
                        .as_ref()
                        .map(|wc| Arc::ptr_eq(wc, &source))
                        .unwrap_or(false);
                    let verifier = VerifyingClient::new(
                        source,
                        previous_result.clone(),
                        full_verify,
                        scheme,
                    );
                    verifiers.push(verifier.clone());
                    let handle: Arc<dyn Client> = Arc::new(verifier);
                    if is_watcher {
                        passive_handle = Some(handle.clone());
                    }
                    handle
                })
                .collect()
        };

        let optimizer = OptimizingClient::new(backends, optimizing)?;
        if let Some(passive) = &passive_handle {
            optimizer.mark_passive(passive);
        }

        let serving: Arc<dyn Client> = if cache_size > 0 {
            Arc::new(CachingClient::new(
                Arc::new(optimizer.clone()),
                cache.clone(),
            ))
        } else {
            Arc::new(optimizer.clone())
        };

        // back-edge: trust walks consult the caching layer
        for verifier in &verifiers {
            verifier.set_indirect(serving.clone());
        }
        optimizer.start();

        let aggregator =
            WatchAggregator::new(serving, passive_handle, auto_watch, auto_watch_retry);
        aggregator.start();
        Ok(Arc::new(aggregator))
    }
}

/// Ask each backend for chain info in turn, accumulating failures.
async fn bootstrap_info(
    clients: &[Arc<dyn Client>],
    timeout: Duration,
) -> Result<ChainInfo> {
    let mut failures: Vec<String> = Vec::new();
    for client in clients {
        match tokio::time::timeout(timeout, client.info()).await {
            Ok(Ok(info)) => return Ok(info),
            Ok(Err(err)) => failures.push(format!("{}: {err}", client.name())),
            Err(_) => failures.push(format!("{}: info fetch timed out", client.name())),
        }
    }
    Err(Error::NotAvailable(failures.join("; ")))
}
