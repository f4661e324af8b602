//! Provider discovery.
//!
//! The directory answers "who claims to hold this identifier?". Answers
//! are advisory: a provider may be offline, stale or lying, and the
//! session layer finds out when it negotiates. Nothing here is trusted
//! with content.
//!
//! Lookups are streamed. The resolver starts negotiating with the first
//! provider while the DHT walk is still running, which is what keeps the
//! peer path competitive with the gateway.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use codio_core::ContentId;
use futures::{Future, Stream, StreamExt};
use futures_timer::Delay;
use libp2p::kad::RecordKey;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::{
    boxed_future, kad::record_key, with_timeout, BoxedFuture, BoxedStream, MaybeSend, MaybeSync,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("address {addr} has no /p2p/ peer id")]
    MissingPeerId { addr: String },

    #[error("invalid peer address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
}

/// A peer and the addresses it was last reachable at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddress {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
        }
    }

    pub fn with_addrs(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Build from a full address ending in `/p2p/<peer id>`.
    pub fn from_multiaddr(addr: Multiaddr) -> Result<Self, DirectoryError> {
        match addr.iter().last() {
            Some(Protocol::P2p(peer_id)) => Ok(Self {
                peer_id,
                addrs: vec![addr],
            }),
            _ => Err(DirectoryError::MissingPeerId {
                addr: addr.to_string(),
            }),
        }
    }

    pub fn parse(s: &str) -> Result<Self, DirectoryError> {
        let addr: Multiaddr = s.parse().map_err(|e: libp2p::multiaddr::Error| {
            DirectoryError::InvalidAddress {
                addr: s.to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::from_multiaddr(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id)
    }
}

/// One provider claim reported by a DHT backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtProviderEvent {
    pub peer: PeerId,
    pub addresses: Vec<Multiaddr>,
    /// Round-trip time to the provider, when the backend has measured one.
    pub rtt: Option<Duration>,
}

impl DhtProviderEvent {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            addresses: Vec::new(),
            rtt: None,
        }
    }
}

/// A provider for a specific identifier.
#[derive(Clone, Debug)]
pub struct ProviderRecord {
    pub cid: ContentId,
    pub peer: PeerAddress,
    pub last_seen: Instant,
    pub rtt_estimate: Option<Duration>,
}

/// Source of provider claims.
///
/// `lookup` should return as soon as the query is under way and report
/// providers on the stream as they arrive. The stream ends when the backend
/// has nothing more to report.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait DhtBackend: MaybeSend + MaybeSync {
    async fn lookup(&self, key: RecordKey)
        -> Result<BoxedStream<DhtProviderEvent>, DirectoryError>;

    /// Announce this node as a provider of `key`. Backends that cannot
    /// announce accept and ignore it.
    async fn provide(&self, key: RecordKey) -> Result<(), DirectoryError> {
        trace!(key = ?key, "Backend does not announce providers");
        Ok(())
    }
}

/// Addresses learned from earlier lookups, reused until they expire.
pub struct ProviderAddressCache {
    ttl: Duration,
    entries: Mutex<HashMap<PeerId, (Vec<Multiaddr>, Instant)>>,
}

impl ProviderAddressCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, peer: PeerId, addrs: &[Multiaddr]) {
        if addrs.is_empty() {
            return;
        }
        self.entries
            .lock()
            .insert(peer, (addrs.to_vec(), Instant::now()));
    }

    /// Known addresses for `peer`, if learned within the TTL.
    pub fn lookup(&self, peer: &PeerId) -> Option<Vec<Multiaddr>> {
        let mut entries = self.entries.lock();
        match entries.get(peer) {
            Some((addrs, at)) if at.elapsed() < self.ttl => Some(addrs.clone()),
            Some(_) => {
                entries.remove(peer);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Directory client used by the resolver.
pub struct ProviderDirectory {
    backend: Arc<dyn DhtBackend>,
    addresses: Arc<ProviderAddressCache>,
}

impl ProviderDirectory {
    pub fn new(backend: Arc<dyn DhtBackend>, address_ttl: Duration) -> Self {
        Self {
            backend,
            addresses: Arc::new(ProviderAddressCache::new(address_ttl)),
        }
    }

    pub fn address_cache(&self) -> &Arc<ProviderAddressCache> {
        &self.addresses
    }

    /// Stream up to `limit` distinct providers of `cid`, ending after
    /// `timeout` or when the backend is done, whichever is first.
    ///
    /// Returns immediately. The backend query runs inside the stream, so
    /// `timeout` also bounds a backend that is slow to answer at all.
    ///
    /// A failing backend yields an empty stream: no providers is a routine
    /// outcome and the resolver falls back on it.
    pub fn find_providers(&self, cid: &ContentId, limit: usize, timeout: Duration) -> ProviderStream {
        debug!(cid = %cid, limit, timeout_ms = timeout.as_millis() as u64, "Looking up providers");
        let backend = Arc::clone(&self.backend);
        let key = record_key(cid);
        let lookup = boxed_future(async move { backend.lookup(key).await });
        ProviderStream {
            cid: cid.clone(),
            state: LookupState::Querying(lookup),
            deadline: Delay::new(timeout),
            seen: HashSet::new(),
            remaining: limit,
            addresses: Arc::clone(&self.addresses),
        }
    }

    /// Announce this node as a provider of `cid`, giving up after `timeout`.
    pub async fn announce(&self, cid: &ContentId, timeout: Duration) -> Result<(), DirectoryError> {
        debug!(cid = %cid, "Announcing provider record");
        with_timeout(timeout, self.backend.provide(record_key(cid)))
            .await
            .unwrap_or_else(|| Err(DirectoryError::Unavailable("announcement timed out".to_string())))
    }
}

enum LookupState {
    Querying(BoxedFuture<Result<BoxedStream<DhtProviderEvent>, DirectoryError>>),
    Streaming(BoxedStream<DhtProviderEvent>),
    Done,
}

/// Deduplicated, capped, time-bounded stream of [`ProviderRecord`]s.
pub struct ProviderStream {
    cid: ContentId,
    state: LookupState,
    deadline: Delay,
    seen: HashSet<PeerId>,
    remaining: usize,
    addresses: Arc<ProviderAddressCache>,
}

impl ProviderStream {
    fn record_for(&self, event: DhtProviderEvent) -> ProviderRecord {
        let addrs = if event.addresses.is_empty() {
            self.addresses.lookup(&event.peer).unwrap_or_default()
        } else {
            self.addresses.record(event.peer, &event.addresses);
            event.addresses
        };
        ProviderRecord {
            cid: self.cid.clone(),
            peer: PeerAddress::with_addrs(event.peer, addrs),
            last_seen: Instant::now(),
            rtt_estimate: event.rtt,
        }
    }
}

impl Stream for ProviderStream {
    type Item = ProviderRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.remaining == 0 {
            this.state = LookupState::Done;
        }
        if matches!(this.state, LookupState::Done) {
            return Poll::Ready(None);
        }
        if Pin::new(&mut this.deadline).poll(cx).is_ready() {
            debug!(cid = %this.cid, found = this.seen.len(), "Provider lookup timed out");
            this.state = LookupState::Done;
            return Poll::Ready(None);
        }

        loop {
            match &mut this.state {
                LookupState::Querying(lookup) => match lookup.as_mut().poll(cx) {
                    Poll::Ready(Ok(events)) => this.state = LookupState::Streaming(events),
                    Poll::Ready(Err(e)) => {
                        warn!(cid = %this.cid, error = %e, "Provider lookup failed");
                        this.state = LookupState::Done;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                },
                LookupState::Streaming(events) => match events.poll_next_unpin(cx) {
                    Poll::Ready(Some(event)) => {
                        if !this.seen.insert(event.peer) {
                            continue;
                        }
                        this.remaining -= 1;
                        return Poll::Ready(Some(this.record_for(event)));
                    }
                    Poll::Ready(None) => {
                        this.state = LookupState::Done;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                },
                LookupState::Done => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    struct StaticDht {
        events: Vec<DhtProviderEvent>,
    }

    #[async_trait]
    impl DhtBackend for StaticDht {
        async fn lookup(
            &self,
            _key: RecordKey,
        ) -> Result<BoxedStream<DhtProviderEvent>, DirectoryError> {
            Ok(crate::boxed_stream(futures::stream::iter(self.events.clone())))
        }
    }

    struct BrokenDht;

    #[async_trait]
    impl DhtBackend for BrokenDht {
        async fn lookup(
            &self,
            _key: RecordKey,
        ) -> Result<BoxedStream<DhtProviderEvent>, DirectoryError> {
            Err(DirectoryError::Unavailable("no bootstrap peers".to_string()))
        }
    }

    struct ChannelBackedDht {
        rx: Mutex<Option<mpsc::UnboundedReceiver<DhtProviderEvent>>>,
    }

    #[async_trait]
    impl DhtBackend for ChannelBackedDht {
        async fn lookup(
            &self,
            _key: RecordKey,
        ) -> Result<BoxedStream<DhtProviderEvent>, DirectoryError> {
            let rx = self.rx.lock().take().expect("single lookup");
            Ok(crate::boxed_stream(rx))
        }
    }

    struct SlowDht {
        delay: Duration,
    }

    #[async_trait]
    impl DhtBackend for SlowDht {
        async fn lookup(
            &self,
            _key: RecordKey,
        ) -> Result<BoxedStream<DhtProviderEvent>, DirectoryError> {
            tokio::time::sleep(self.delay).await;
            Ok(crate::boxed_stream(futures::stream::iter(vec![
                DhtProviderEvent::new(PeerId::random()),
            ])))
        }
    }

    fn directory(backend: impl DhtBackend + 'static) -> ProviderDirectory {
        ProviderDirectory::new(Arc::new(backend), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_duplicates_are_collapsed() {
        let peer = PeerId::random();
        let other = PeerId::random();
        let dir = directory(StaticDht {
            events: vec![
                DhtProviderEvent::new(peer),
                DhtProviderEvent::new(peer),
                DhtProviderEvent::new(other),
            ],
        });
        let cid = ContentId::derive(b"dedup");
        let records: Vec<ProviderRecord> = dir
            .find_providers(&cid, 10, Duration::from_secs(1))
            .collect()
            .await;
        let peers: Vec<PeerId> = records.iter().map(|r| r.peer.peer_id).collect();
        assert_eq!(peers, vec![peer, other]);
        assert!(records.iter().all(|r| r.cid == cid));
    }

    #[tokio::test]
    async fn test_limit_caps_results() {
        let events = (0..10).map(|_| DhtProviderEvent::new(PeerId::random())).collect();
        let dir = directory(StaticDht { events });
        let count = dir
            .find_providers(&ContentId::derive(b"cap"), 3, Duration::from_secs(1))
            .count()
            .await;
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_backend_failure_yields_empty_stream() {
        let dir = directory(BrokenDht);
        let count = dir
            .find_providers(&ContentId::derive(b"broken"), 5, Duration::from_secs(1))
            .count()
            .await;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_stream_ends_at_timeout_with_partial_results() {
        let (tx, rx) = mpsc::unbounded();
        let dir = directory(ChannelBackedDht {
            rx: Mutex::new(Some(rx)),
        });
        tx.unbounded_send(DhtProviderEvent::new(PeerId::random()))
            .unwrap();

        let started = Instant::now();
        let records: Vec<_> = dir
            .find_providers(&ContentId::derive(b"slow"), 5, Duration::from_millis(100))
            .collect()
            .await;
        assert_eq!(records.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(90));
        // Sender still alive: the stream ended on the deadline, not on close.
        drop(tx);
    }

    #[tokio::test]
    async fn test_timeout_bounds_a_backend_that_never_answers() {
        let dir = directory(SlowDht {
            delay: Duration::from_secs(5),
        });
        let started = Instant::now();
        let stream = dir.find_providers(&ContentId::derive(b"stalled"), 5, Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(50));

        let records: Vec<_> = stream.collect().await;
        assert!(records.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_slow_backend_within_timeout_still_reports() {
        let dir = directory(SlowDht {
            delay: Duration::from_millis(50),
        });
        let count = dir
            .find_providers(&ContentId::derive(b"late"), 5, Duration::from_secs(1))
            .count()
            .await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_announce_defaults_to_accepting() {
        let directory = ProviderDirectory::new(Arc::new(BrokenDht), Duration::from_secs(60));
        let cid = ContentId::derive(b"published here");
        assert!(directory.announce(&cid, Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn test_addresses_filled_from_cache() {
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/10.0.0.1/udp/4001/webrtc-direct".parse().unwrap();
        let dir = directory(StaticDht {
            events: vec![DhtProviderEvent::new(peer)],
        });
        dir.address_cache().record(peer, &[addr.clone()]);

        let records: Vec<_> = dir
            .find_providers(&ContentId::derive(b"addr"), 5, Duration::from_secs(1))
            .collect()
            .await;
        assert_eq!(records[0].peer.addrs, vec![addr]);
    }

    #[test]
    fn test_address_cache_expires() {
        let cache = ProviderAddressCache::new(Duration::from_millis(0));
        let peer = PeerId::random();
        cache.record(peer, &["/ip4/127.0.0.1/tcp/1".parse().unwrap()]);
        assert!(cache.lookup(&peer).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_peer_address_from_multiaddr() {
        let peer = PeerId::random();
        let full = format!("/ip4/192.0.2.1/udp/9090/webrtc-direct/p2p/{}", peer);
        let parsed = PeerAddress::parse(&full).unwrap();
        assert_eq!(parsed.peer_id, peer);
        assert_eq!(parsed.addrs.len(), 1);

        assert!(matches!(
            PeerAddress::parse("/ip4/192.0.2.1/tcp/1"),
            Err(DirectoryError::MissingPeerId { .. })
        ));
        assert!(matches!(
            PeerAddress::parse("not an address"),
            Err(DirectoryError::InvalidAddress { .. })
        ));
    }
}
