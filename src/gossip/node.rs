//! libp2p gossipsub plumbing
//!
//! Owns the swarm on a background task. Message validation is delegated
//! to the bridge: the behaviour is configured with explicit validation,
//! raw messages flow out over a channel, and verdicts flow back in to be
//! reported against the originating peer.

use super::validator::Verdict;
use crate::error::{Error, Result};
use futures::StreamExt;
use libp2p::gossipsub::{self, MessageAcceptance, MessageId};
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered raw messages between the swarm task and the validator loop.
const NODE_CHANNEL_SIZE: usize = 64;

/// Listen address and bootstrap peers for the gossip node.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Multiaddr to listen on
    pub listen_addr: Multiaddr,
    /// Relay peers to dial at startup
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/0"
                .parse()
                .expect("static multiaddr"),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// One raw message received on the topic, pending validation.
pub(crate) struct GossipEvent {
    pub message_id: MessageId,
    pub source: PeerId,
    pub data: Vec<u8>,
}

/// Start a gossipsub node subscribed to `topic`.
///
/// Returns the stream of raw messages and the channel on which verdicts
/// must be reported back. The node shuts down when `cancel` fires.
pub(crate) fn spawn_node(
    topic: String,
    config: GossipConfig,
    cancel: CancellationToken,
) -> Result<(
    mpsc::Receiver<GossipEvent>,
    mpsc::Sender<(MessageId, PeerId, Verdict)>,
)> {
    let mut swarm = libp2p::SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .map_err(|e| Error::Network(format!("gossip transport: {e}")))?
        .with_dns()
        .map_err(|e| Error::Network(format!("gossip dns: {e}")))?
        .with_behaviour(|key| {
            let config = gossipsub::ConfigBuilder::default()
                .validation_mode(gossipsub::ValidationMode::Strict)
                .validate_messages()
                .build()
                .map_err(|e| Box::<dyn std::error::Error + Send + Sync>::from(e))?;
            gossipsub::Behaviour::<gossipsub::IdentityTransform, gossipsub::AllowAllSubscriptionFilter>::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                config,
            )
            .map_err(Box::<dyn std::error::Error + Send + Sync>::from)
        })
        .map_err(|e| Error::Network(format!("gossip behaviour: {e}")))?
        .build();

    let ident_topic = gossipsub::IdentTopic::new(topic);
    swarm
        .behaviour_mut()
        .subscribe(&ident_topic)
        .map_err(|e| Error::Network(format!("gossip subscribe: {e:?}")))?;
    swarm
        .listen_on(config.listen_addr.clone())
        .map_err(|e| Error::Network(format!("gossip listen: {e:?}")))?;
    for peer in &config.bootstrap_peers {
        if let Err(err) = swarm.dial(peer.clone()) {
            warn!(%peer, %err, "gossip: failed to dial bootstrap peer");
        }
    }

    let (incoming_tx, incoming_rx) = mpsc::channel::<GossipEvent>(NODE_CHANNEL_SIZE);
    let (verdict_tx, mut verdict_rx) =
        mpsc::channel::<(MessageId, PeerId, Verdict)>(NODE_CHANNEL_SIZE);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                verdict = verdict_rx.recv() => {
                    let Some((message_id, source, verdict)) = verdict else { return };
                    let acceptance = match verdict {
                        Verdict::Accept => MessageAcceptance::Accept,
                        Verdict::Ignore => MessageAcceptance::Ignore,
                        Verdict::Reject => MessageAcceptance::Reject,
                    };
                    let _ = swarm.behaviour_mut().report_message_validation_result(
                        &message_id,
                        &source,
                        acceptance,
                    );
                }
                event = swarm.select_next_some() => match event {
                    SwarmEvent::Behaviour(gossipsub::Event::Message {
                        propagation_source,
                        message_id,
                        message,
                    }) => {
                        let event = GossipEvent {
                            message_id,
                            source: propagation_source,
                            data: message.data,
                        };
                        if incoming_tx.try_send(event).is_err() {
                            warn!("gossip: validation backlog full, dropping message");
                        }
                    }
                    SwarmEvent::NewListenAddr { address, .. } => {
                        debug!(%address, "gossip: listening");
                    }
                    _ => {}
                },
            }
        }
    });

    Ok((incoming_rx, verdict_tx))
}
