//! libp2p network behaviour for the Codio directory node.
//!
//! Defines the composite behaviour the swarm task drives:
//! - Kademlia for provider records (the content directory)
//! - Identify so peers learn each other's listen addresses
//! - Ping for connection keep-alive and round-trip estimates
//!
//! Content never travels over this swarm. It only answers "who has this
//! identifier"; transfers happen over separate data-channel sessions.

use std::time::Duration;

use libp2p::{
    identify, identity,
    kad::{self, store::MemoryStore},
    ping,
    swarm::NetworkBehaviour,
    PeerId, StreamProtocol,
};

/// Kademlia protocol name. Codio runs its own DHT rather than joining the
/// public IPFS one.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/codio/kad/1.0.0");

/// Identify protocol version string.
pub const IDENTIFY_PROTOCOL: &str = "/codio/0.1.0";

/// The composite network behaviour for Codio.
#[derive(NetworkBehaviour)]
pub struct CodioBehaviour {
    /// Provider records keyed by content multihash.
    pub kademlia: kad::Behaviour<MemoryStore>,

    /// Exchanges listen addresses and supported protocols.
    pub identify: identify::Behaviour,

    /// Keeps connections alive and measures latency.
    pub ping: ping::Behaviour,
}

impl CodioBehaviour {
    pub fn new(keypair: &identity::Keypair, query_timeout: Duration) -> Self {
        let local_peer_id = keypair.public().to_peer_id();
        Self {
            kademlia: create_kademlia(local_peer_id, query_timeout),
            identify: identify::Behaviour::new(create_identify_config(keypair.public())),
            ping: ping::Behaviour::new(ping::Config::new()),
        }
    }
}

/// Kademlia with an in-memory record store and Codio's protocol name.
pub fn create_kademlia(local_peer_id: PeerId, query_timeout: Duration) -> kad::Behaviour<MemoryStore> {
    let mut config = kad::Config::new(KAD_PROTOCOL);
    config.set_query_timeout(query_timeout);
    kad::Behaviour::with_config(local_peer_id, MemoryStore::new(local_peer_id), config)
}

/// Create identify configuration for Codio.
pub fn create_identify_config(local_public_key: identity::PublicKey) -> identify::Config {
    identify::Config::new(IDENTIFY_PROTOCOL.to_string(), local_public_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kad::{record_key, DhtCommand, KademliaBridge};
    use codio_core::ContentId;

    #[test]
    fn test_behaviour_builds() {
        let keypair = identity::Keypair::generate_ed25519();
        let mut behaviour = CodioBehaviour::new(&keypair, Duration::from_secs(10));

        let mut bridge = KademliaBridge::new();
        let (tx, _rx) = futures::channel::mpsc::unbounded();
        bridge.handle_command(
            &mut behaviour.kademlia,
            DhtCommand::FindProviders {
                key: record_key(&ContentId::derive(b"behaviour")),
                events: tx,
            },
        );
        assert_eq!(bridge.pending_queries(), 1);
    }

    #[test]
    fn test_kad_protocol_name() {
        assert_eq!(KAD_PROTOCOL.as_ref(), "/codio/kad/1.0.0");
    }
}
