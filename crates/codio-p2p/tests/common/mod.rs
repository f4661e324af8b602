//! In-memory stand-ins for the DHT, the peer network and the gateway.
//! Each one counts what it was asked to do so tests can assert on
//! network activity as well as on results.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codio_core::wire::{content_frames, TransferMessage};
use codio_core::ContentId;
use codio_p2p::kad::record_key;
use codio_p2p::{
    boxed_stream, BoxedStream, DataChannel, DhtBackend, DhtProviderEvent, DirectoryError, Gateway,
    GatewayError, PeerAddress, PeerConnector, PendingChannel, PendingConnection, Resolver,
    ResolverConfig, SessionDescription, SignalingChannel, TransportError,
};
use futures::channel::mpsc;
use futures::StreamExt;
use libp2p::kad::RecordKey;
use libp2p::PeerId;
use parking_lot::Mutex;

pub const PRIMARY: &str = "https://primary.test/ipfs";
pub const SECONDARY: &str = "https://secondary.test/ipfs";

pub fn test_config() -> ResolverConfig {
    ResolverConfig {
        peer_concurrency_cap: 4,
        fallback_timeout_ms: 2_000,
        gateway_endpoint: PRIMARY.to_string(),
        fallback_gateways: vec![SECONDARY.to_string()],
        provider_timeout_ms: 1_000,
        negotiation_timeout_ms: 1_000,
        idle_timeout_ms: 1_000,
        gateway_timeout_ms: 1_000,
        cancel_grace_ms: 200,
        resolve_deadline_ms: 5_000,
        ..Default::default()
    }
}

#[derive(Default)]
pub struct MockDht {
    providers: Mutex<HashMap<Vec<u8>, Vec<DhtProviderEvent>>>,
    feeds: Mutex<HashMap<Vec<u8>, mpsc::UnboundedReceiver<DhtProviderEvent>>>,
    stall: Mutex<Option<Duration>>,
    announced: Mutex<Vec<RecordKey>>,
    pub lookups: AtomicUsize,
}

impl MockDht {
    pub fn publish(&self, cid: &ContentId, peer: PeerId, rtt: Option<Duration>) {
        let event = DhtProviderEvent {
            peer,
            addresses: Vec::new(),
            rtt,
        };
        self.providers
            .lock()
            .entry(record_key(cid).to_vec())
            .or_default()
            .push(event);
    }

    /// Hold every lookup for `delay` before it reports anything.
    pub fn stall(&self, delay: Duration) {
        *self.stall.lock() = Some(delay);
    }

    /// Keep the next lookup for `cid` open after the published providers
    /// and report whatever is sent on the returned channel. The walk ends
    /// when the sender is dropped.
    pub fn feed(&self, cid: &ContentId) -> mpsc::UnboundedSender<DhtProviderEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().insert(record_key(cid).to_vec(), rx);
        tx
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn announced(&self) -> Vec<RecordKey> {
        self.announced.lock().clone()
    }
}


#[async_trait]
impl DhtBackend for MockDht {
    async fn lookup(&self, key: RecordKey) -> Result<BoxedStream<DhtProviderEvent>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let stall = *self.stall.lock();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let events = self
            .providers
            .lock()
            .get(&key.to_vec())
            .cloned()
            .unwrap_or_default();
        let published = futures::stream::iter(events);
        match self.feeds.lock().remove(&key.to_vec()) {
            Some(feed) => Ok(boxed_stream(published.chain(feed))),
            None => Ok(boxed_stream(published)),
        }
    }

    async fn provide(&self, key: RecordKey) -> Result<(), DirectoryError> {
        self.announced.lock().push(key);
        Ok(())
    }
}

/// How a simulated peer responds.
#[derive(Clone, Debug)]
pub enum PeerBehaviour {
    /// Negotiates immediately and sends `data` after `delay`.
    Serve { data: Vec<u8>, delay: Duration },
    /// Negotiates, then answers every request with `NotFound`.
    Missing,
    /// Refuses the connection outright.
    Unreachable,
    /// Signaling never answers.
    Silent,
}

#[derive(Default)]
pub struct NetStats {
    pub open: AtomicUsize,
    pub max_open: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub cancels: AtomicUsize,
    pub exchanges: AtomicUsize,
}

impl NetStats {
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockNetwork {
    peers: Mutex<HashMap<PeerId, PeerBehaviour>>,
    offers: Mutex<Vec<PeerId>>,
    pub stats: Arc<NetStats>,
}

impl MockNetwork {
    pub fn add_peer(&self, behaviour: PeerBehaviour) -> PeerId {
        let peer = PeerId::random();
        self.peers.lock().insert(peer, behaviour);
        peer
    }

    /// Peers offered a connection, in order.
    pub fn offers(&self) -> Vec<PeerId> {
        self.offers.lock().clone()
    }

    fn behaviour(&self, peer: &PeerId) -> Option<PeerBehaviour> {
        self.peers.lock().get(peer).cloned()
    }
}

#[async_trait]
impl PeerConnector for MockNetwork {
    async fn create_offer(&self, peer: &PeerAddress) -> Result<PendingConnection, TransportError> {
        self.offers.lock().push(peer.peer_id);
        let behaviour = match self.behaviour(&peer.peer_id) {
            Some(PeerBehaviour::Unreachable) | None => {
                return Err(TransportError::connection(peer, "unreachable"))
            }
            Some(behaviour) => behaviour,
        };
        Ok(PendingConnection {
            offer: SessionDescription::offer(format!("offer for {}", peer)),
            channel: Box::new(MockPending {
                behaviour,
                stats: Arc::clone(&self.stats),
            }),
        })
    }
}

#[async_trait]
impl SignalingChannel for MockNetwork {
    async fn exchange(
        &self,
        peer: &PeerAddress,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.stats.exchanges.fetch_add(1, Ordering::SeqCst);
        if let Some(PeerBehaviour::Silent) = self.behaviour(&peer.peer_id) {
            futures::future::pending::<()>().await;
        }
        Ok(SessionDescription::answer(format!("answer from {}", peer)))
    }
}

struct MockPending {
    behaviour: PeerBehaviour,
    stats: Arc<NetStats>,
}

#[async_trait]
impl PendingChannel for MockPending {
    async fn complete(
        self: Box<Self>,
        _answer: SessionDescription,
    ) -> Result<Box<dyn DataChannel>, TransportError> {
        let open = self.stats.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_open.fetch_max(open, Ordering::SeqCst);
        self.stats.opened.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded();
        Ok(Box::new(MockChannel {
            behaviour: self.behaviour,
            to_requester: tx,
            inbound: rx,
            stats: self.stats,
            closed: false,
        }))
    }
}

struct MockChannel {
    behaviour: PeerBehaviour,
    to_requester: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    stats: Arc<NetStats>,
    closed: bool,
}

#[async_trait]
impl DataChannel for MockChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        match TransferMessage::decode(&frame) {
            Ok(TransferMessage::Request { cid }) => {
                let tx = self.to_requester.clone();
                let behaviour = self.behaviour.clone();
                tokio::spawn(async move {
                    match behaviour {
                        PeerBehaviour::Serve { data, delay } => {
                            tokio::time::sleep(delay).await;
                            for frame in content_frames(&data, 1024) {
                                if tx.unbounded_send(frame.encode()).is_err() {
                                    return;
                                }
                            }
                        }
                        _ => {
                            let _ = tx.unbounded_send(TransferMessage::NotFound { cid }.encode());
                        }
                    }
                });
            }
            Ok(TransferMessage::Cancel) => {
                self.stats.cancels.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.next().await
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inbound.close();
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub enum GatewayResponse {
    Body(Vec<u8>),
    Status(u16),
    Slow(Duration, Vec<u8>),
}

#[derive(Default)]
pub struct MockGateway {
    routes: Mutex<HashMap<String, GatewayResponse>>,
    calls: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn route(&self, endpoint: &str, response: GatewayResponse) {
        self.routes.lock().insert(endpoint.to_string(), response);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn get(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        self.calls.lock().push(url.to_string());
        let response = self
            .routes
            .lock()
            .iter()
            .find(|(endpoint, _)| url.starts_with(endpoint.as_str()))
            .map(|(_, response)| response.clone());
        match response {
            Some(GatewayResponse::Body(body)) => Ok(body),
            Some(GatewayResponse::Status(status)) => Err(GatewayError::Status { status }),
            Some(GatewayResponse::Slow(delay, body)) => {
                tokio::time::sleep(delay).await;
                Ok(body)
            }
            None => Err(GatewayError::Status { status: 404 }),
        }
    }
}

pub struct Harness {
    pub dht: Arc<MockDht>,
    pub network: Arc<MockNetwork>,
    pub gateway: Arc<MockGateway>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dht: Arc::new(MockDht::default()),
            network: Arc::new(MockNetwork::default()),
            gateway: Arc::new(MockGateway::default()),
        }
    }

    pub fn resolver(&self, config: ResolverConfig) -> Resolver {
        Resolver::new(
            config,
            self.dht.clone(),
            self.network.clone(),
            self.network.clone(),
            self.gateway.clone(),
        )
        .expect("valid test config")
    }

    /// Add a peer serving `data` and announce it as a provider of `cid`.
    pub fn serving_peer(&self, cid: &ContentId, data: &[u8], delay: Duration) -> PeerId {
        let peer = self.network.add_peer(PeerBehaviour::Serve {
            data: data.to_vec(),
            delay,
        });
        self.dht.publish(cid, peer, None);
        peer
    }
}
