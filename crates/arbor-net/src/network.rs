use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, kad, noise, ping, tcp, yamux,
    swarm::{NetworkBehaviour, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use arbor_consensus::ConsensusOutbound;
use arbor_core::pbft_block::PbftBlock;
use arbor_core::types::PeerTag;
use arbor_core::vote::Vote;

use crate::config::NetConfig;
use crate::message::NetMessage;

/// Combined libp2p network behaviour.
///
/// The `#[derive(NetworkBehaviour)]` macro auto-generates an
/// `ArborBehaviourEvent` enum with one variant per field.
#[derive(NetworkBehaviour)]
pub struct ArborBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

/// Application-facing handle returned from `Network::new()`.
pub struct NetworkHandle {
    /// Send here to publish a message to all gossip peers.
    pub outbound_tx: mpsc::Sender<NetMessage>,
    /// Receive here to consume `(source peer, message)` pairs.
    pub inbound_rx: mpsc::Receiver<(PeerTag, NetMessage)>,
    /// Local libp2p peer identity.
    pub local_peer_id: PeerId,
}

/// Outbound sink the consensus engines publish through.
///
/// Wraps the node's outbound channel and applies the per-peer broadcast
/// filters: a vote goes out only while some peer has not seen its hash, and
/// next-vote bundles only while a peer at a round at or below the bundle's
/// still wants one.
pub struct GossipOutbound {
    outbound_tx: mpsc::Sender<NetMessage>,
    peers: Arc<crate::peer::PeerTable>,
}

/// Bundles pushed to one peer before it must ask again.
const MAX_BUNDLES_PER_PEER: u64 = 10;

impl GossipOutbound {
    pub fn new(
        outbound_tx: mpsc::Sender<NetMessage>,
        peers: Arc<crate::peer::PeerTable>,
    ) -> Arc<Self> {
        Arc::new(Self { outbound_tx, peers })
    }

    fn send(&self, msg: NetMessage) {
        if let Err(e) = self.outbound_tx.try_send(msg) {
            debug!(error = %e, "outbound queue full, dropping gossip");
        }
    }
}

impl ConsensusOutbound for GossipOutbound {
    fn gossip_vote(&self, vote: &Vote) {
        // With no peer registered yet, publish anyway so gossip warms up.
        if !self.peers.is_empty() && self.peers.vote_targets(&vote.hash).is_empty() {
            return;
        }
        self.send(NetMessage::Vote(Box::new(vote.clone())));
    }

    fn gossip_pbft_block(&self, block: &PbftBlock) {
        self.send(NetMessage::PbftBlock(Box::new(block.clone())));
    }

    fn gossip_votes_bundle(&self, votes: &[Arc<Vote>]) {
        if votes.is_empty() {
            return;
        }
        let round = votes[0].round;
        if !self.peers.is_empty()
            && self
                .peers
                .bundle_targets(round, MAX_BUNDLES_PER_PEER)
                .is_empty()
        {
            return;
        }
        let votes: Vec<Vote> = votes.iter().map(|v| (**v).clone()).collect();
        self.send(NetMessage::VotesSync { votes });
    }

    fn gossip_dag_block(&self, block: &arbor_core::dag_block::DagBlock) {
        self.send(NetMessage::DagBlock(Box::new(block.clone())));
    }
}

/// Owns the libp2p Swarm. Pass to `tokio::spawn(network.run())`.
pub struct Network {
    swarm: Swarm<ArborBehaviour>,
    topic: gossipsub::IdentTopic,
    outbound_rx: mpsc::Receiver<NetMessage>,
    inbound_tx: mpsc::Sender<(PeerTag, NetMessage)>,
}

impl Network {
    /// Build the network and return `(Network, NetworkHandle)`.
    pub fn new(
        config: &NetConfig,
    ) -> Result<(Self, NetworkHandle), Box<dyn std::error::Error + Send + Sync>> {
        let topic = gossipsub::IdentTopic::new(&config.topic);

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key: &libp2p::identity::Keypair| {
                let message_id_fn = |msg: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    msg.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };

                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let store = kad::store::MemoryStore::new(key.public().to_peer_id());
                let kademlia = kad::Behaviour::new(key.public().to_peer_id(), store);

                let identify = identify::Behaviour::new(identify::Config::new(
                    config.protocol_version.clone(),
                    key.public(),
                ));

                let ping = ping::Behaviour::default();

                Ok(ArborBehaviour { gossipsub, kademlia, identify, ping })
            })?
            .build();

        swarm.behaviour_mut().gossipsub.subscribe(&topic)?;

        let listen_addr: Multiaddr = config.listen_addr.parse()?;
        swarm.listen_on(listen_addr)?;

        for addr_str in &config.boot_nodes {
            if let Ok(addr) = addr_str.parse::<Multiaddr>() {
                if let Some(libp2p::multiaddr::Protocol::P2p(peer_id)) = addr.iter().last() {
                    swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                    debug!(peer = %peer_id, "added boot node");
                }
            }
        }

        let local_peer_id = *swarm.local_peer_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);

        let network = Network { swarm, topic, outbound_rx, inbound_tx };
        let handle = NetworkHandle { outbound_tx, inbound_rx, local_peer_id };

        Ok((network, handle))
    }

    /// Drive the network event loop. Run in a dedicated tokio task.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(msg) = self.outbound_rx.recv() => {
                    let data = msg.to_bytes();
                    if let Err(e) = self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .publish(self.topic.clone(), data)
                    {
                        debug!(error = %e, "gossipsub publish failed");
                    }
                }

                event = self.swarm.select_next_some() => {
                    match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "listening");
                        }
                        SwarmEvent::Behaviour(ArborBehaviourEvent::Gossipsub(
                            gossipsub::Event::Message { propagation_source, message, .. },
                        )) => {
                            match NetMessage::from_bytes(&message.data) {
                                Ok(msg) => {
                                    let source = message
                                        .source
                                        .unwrap_or(propagation_source)
                                        .to_string();
                                    let _ = self.inbound_tx.send((source, msg)).await;
                                }
                                Err(e) => warn!(error = %e, "undecodable gossip payload"),
                            }
                        }
                        SwarmEvent::Behaviour(ArborBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            for addr in info.listen_addrs {
                                self.swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&peer_id, addr);
                            }
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            debug!(peer = %peer_id, "connection established");
                        }
                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            debug!(peer = %peer_id, "connection closed");
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
