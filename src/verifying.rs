//! Verifying client
//!
//! Wraps one backend and rejects any beacon whose signature does not
//! verify against the chain's public key. In strict mode on chained
//! schemes it additionally re-derives trust through a walk from the
//! point of trust, so every previous signature used in verification is
//! itself verified.

use crate::beacon::Beacon;
use crate::chain::ChainInfo;
use crate::client::{BeaconStream, Client};
use crate::error::{Error, Result};
use crate::scheme::{randomness_from_signature, Scheme};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

/// Client layer performing signature verification on every beacon.
#[derive(Clone)]
pub struct VerifyingClient {
    state: Arc<VerifyState>,
}

struct VerifyState {
    /// Direct backend; `get` and `watch` results are proxied from here.
    inner: Arc<dyn Client>,
    /// Backend used to back-fetch rounds during trust walks. Injected
    /// once after construction so walks go through the caching layer.
    indirect: OnceLock<Arc<dyn Client>>,
    /// Highest beacon already verified against the root; the lock is
    /// released around every network fetch.
    point_of_trust: Mutex<Option<Beacon>>,
    strict: bool,
    scheme: Scheme,
}

impl VerifyingClient {
    /// Wrap `inner`, optionally seeding the point of trust with a
    /// previously verified beacon.
    pub fn new(
        inner: Arc<dyn Client>,
        previous_result: Option<Beacon>,
        strict: bool,
        scheme: Scheme,
    ) -> Self {
        Self {
            state: Arc::new(VerifyState {
                inner,
                indirect: OnceLock::new(),
                point_of_trust: Mutex::new(previous_result),
                strict,
                scheme,
            }),
        }
    }

    /// One-shot injection of the backend used for back-fetching rounds.
    /// Later calls are ignored.
    pub fn set_indirect(&self, client: Arc<dyn Client>) {
        let _ = self.state.indirect.set(client);
    }

    /// Round of the current point of trust, if any.
    pub fn point_of_trust_round(&self) -> Option<u64> {
        self.state
            .point_of_trust
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.round)
    }
}

impl VerifyState {
    fn indirect(&self) -> Arc<dyn Client> {
        self.indirect
            .get()
            .cloned()
            .unwrap_or_else(|| self.inner.clone())
    }

    /// Verify `beacon` against `info`, recomputing its randomness.
    async fn verify(&self, info: &ChainInfo, beacon: &mut Beacon) -> Result<()> {
        beacon.check_wire()?;

        let previous = if self.strict && self.scheme.is_chained() {
            self.trusted_previous_signature(info, beacon.round).await?
        } else {
            beacon.previous_signature.clone()
        };

        self.scheme
            .verify(&info.public_key, beacon.round, &previous, &beacon.signature)?;

        // never trust the randomness field as received
        beacon.randomness = randomness_from_signature(&beacon.signature);
        Ok(())
    }

    /// Trusted previous signature for `round`, walking forward from the
    /// point of trust (or from round 1) and verifying every step.
    async fn trusted_previous_signature(
        &self,
        info: &ChainInfo,
        round: u64,
    ) -> Result<Vec<u8>> {
        if round <= 1 {
            return Ok(info.genesis_seed.clone());
        }

        // Walks only move forward: an earlier target restarts from the
        // genesis seed.
        let (mut trust_round, mut trust_prev) = {
            let pot = self.point_of_trust.lock().unwrap();
            match pot.as_ref() {
                Some(p) if p.round < round => (p.round, p.signature.clone()),
                _ => (0, info.genesis_seed.clone()),
            }
        };

        let mut advanced: Option<Beacon> = None;
        while trust_round < round - 1 {
            let next_round = trust_round + 1;
            debug!(round = next_round, "trust walk: loading round to verify");

            let next = self.indirect().get(next_round).await?;
            if next.round != next_round {
                return Err(Error::RoundMismatch {
                    requested: next_round,
                    returned: next.round,
                });
            }
            self.scheme
                .verify(&info.public_key, next_round, &trust_prev, &next.signature)?;

            trust_prev = next.signature.clone();
            trust_round = next_round;
            advanced = Some(next);
        }

        if let Some(beacon) = advanced {
            let mut pot = self.point_of_trust.lock().unwrap();
            if pot.as_ref().map_or(true, |p| p.round < beacon.round) {
                *pot = Some(beacon);
            }
        }

        Ok(trust_prev)
    }
}

impl std::fmt::Debug for VerifyingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyingClient")
            .field("strict", &self.state.strict)
            .field("scheme", &self.state.scheme)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for VerifyingClient {
    async fn info(&self) -> Result<ChainInfo> {
        self.state.inner.info().await
    }

    async fn get(&self, round: u64) -> Result<Beacon> {
        let info = self.state.indirect().info().await?;
        let mut beacon = self.state.inner.get(round).await?;
        self.state.verify(&info, &mut beacon).await?;
        if round != 0 && beacon.round != round {
            return Err(Error::RoundMismatch {
                requested: round,
                returned: beacon.round,
            });
        }
        Ok(beacon)
    }

    async fn watch(&self) -> BeaconStream {
        let state = self.state.clone();
        let info = match state.indirect().info().await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "verifying watch: could not get chain info");
                return futures::stream::empty().boxed();
            }
        };

        let (tx, rx) = mpsc::channel::<Beacon>(1);
        let mut upstream = state.inner.watch().await;
        tokio::spawn(async move {
            while let Some(mut beacon) = upstream.next().await {
                if let Err(err) = state.verify(&info, &mut beacon).await {
                    warn!(
                        round = beacon.round,
                        %err,
                        "failed signature verification, something nefarious could be going on"
                    );
                    continue;
                }
                if tx.send(beacon).await.is_err() {
                    return;
                }
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    fn round_at(&self, t: SystemTime) -> u64 {
        self.state.inner.round_at(t)
    }

    async fn close(&self) -> Result<()> {
        self.state.inner.close().await
    }

    fn name(&self) -> String {
        format!("{}+verify", self.state.inner.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockClient, TestChain};

    #[tokio::test]
    async fn accepts_valid_beacons_and_recomputes_randomness() {
        let chain = TestChain::new(Scheme::PedersenBlsUnchained);
        let mut published = chain.beacon(12);
        published.randomness = vec![0u8; 32]; // relay lies about randomness

        let mock = Arc::new(MockClient::with_beacons(chain.info(), vec![published]));
        let client = VerifyingClient::new(mock, None, false, chain.scheme());

        let beacon = client.get(12).await.unwrap();
        assert_eq!(
            beacon.randomness,
            randomness_from_signature(&beacon.signature)
        );
    }

    #[tokio::test]
    async fn rejects_forged_signatures() {
        let chain = TestChain::new(Scheme::PedersenBlsUnchained);
        let mut forged = chain.beacon(12);
        forged.signature = chain.beacon(13).signature;

        let mock = Arc::new(MockClient::with_beacons(chain.info(), vec![forged]));
        let client = VerifyingClient::new(mock, None, false, chain.scheme());

        assert!(matches!(
            client.get(12).await.unwrap_err(),
            Error::InvalidBeacon(_)
        ));
    }

    #[tokio::test]
    async fn detects_round_mismatch() {
        let chain = TestChain::new(Scheme::PedersenBlsUnchained);
        let wrong_round = chain.beacon(9);

        let mock = Arc::new(MockClient::with_beacons(chain.info(), vec![wrong_round]));
        let client = VerifyingClient::new(mock, None, false, chain.scheme());

        assert!(matches!(
            client.get(4).await.unwrap_err(),
            Error::RoundMismatch {
                requested: 4,
                returned: 9
            }
        ));
    }

    #[tokio::test]
    async fn strict_walk_verifies_every_intermediate_round() {
        let chain = TestChain::new(Scheme::PedersenBlsChained);
        let target = chain.beacon(5);

        // direct backend serves the target; intermediate rounds come
        // from the indirect backend
        let direct = Arc::new(MockClient::with_beacons(chain.info(), vec![target]));
        let indirect = Arc::new(MockClient::strict_rounds(
            chain.info(),
            (1..=4).map(|r| chain.beacon(r)).collect(),
        ));

        let client = VerifyingClient::new(direct, None, true, chain.scheme());
        client.set_indirect(indirect.clone());

        let beacon = client.get(5).await.unwrap();
        assert_eq!(beacon.round, 5);
        // walk fetched rounds 1..=4 through the indirect client
        assert_eq!(indirect.gets(), 4);
        // and advanced the point of trust to round 4
        assert_eq!(client.point_of_trust_round(), Some(4));
    }

    #[tokio::test]
    async fn strict_walk_resumes_from_the_point_of_trust() {
        let chain = TestChain::new(Scheme::PedersenBlsChained);

        let direct = Arc::new(MockClient::with_beacons(
            chain.info(),
            vec![chain.beacon(6)],
        ));
        let indirect = Arc::new(MockClient::strict_rounds(
            chain.info(),
            (1..=5).map(|r| chain.beacon(r)).collect(),
        ));

        let client =
            VerifyingClient::new(direct, Some(chain.beacon(3)), true, chain.scheme());
        client.set_indirect(indirect.clone());

        client.get(6).await.unwrap();
        // only rounds 4 and 5 needed fetching
        assert_eq!(indirect.gets(), 2);
        assert_eq!(client.point_of_trust_round(), Some(5));
    }

    #[tokio::test]
    async fn strict_walk_rejects_a_broken_chain() {
        let chain = TestChain::new(Scheme::PedersenBlsChained);
        let other = TestChain::with_seed(Scheme::PedersenBlsChained, [8u8; 32]);

        // round 2 in the walk comes from a different chain entirely
        let mut intermediate: Vec<Beacon> = (1..=3).map(|r| chain.beacon(r)).collect();
        intermediate[1] = other.beacon(2);

        let direct = Arc::new(MockClient::with_beacons(
            chain.info(),
            vec![chain.beacon(4)],
        ));
        let indirect = Arc::new(MockClient::strict_rounds(chain.info(), intermediate));

        let client = VerifyingClient::new(direct, None, true, chain.scheme());
        client.set_indirect(indirect);

        assert!(matches!(
            client.get(4).await.unwrap_err(),
            Error::InvalidBeacon(_)
        ));
    }

    #[tokio::test]
    async fn watch_drops_unverifiable_beacons() {
        let chain = TestChain::new(Scheme::PedersenBlsUnchained);
        let mut bad = chain.beacon(2);
        bad.signature = chain.beacon(99).signature;

        let mock = Arc::new(MockClient::with_beacons(
            chain.info(),
            vec![chain.beacon(1), bad, chain.beacon(3)],
        ));
        let client = VerifyingClient::new(mock, None, false, chain.scheme());

        let mut stream = client.watch().await;
        assert_eq!(stream.next().await.unwrap().round, 1);
        // round 2 is silently skipped
        assert_eq!(stream.next().await.unwrap().round, 3);
        assert!(stream.next().await.is_none());
    }
}
