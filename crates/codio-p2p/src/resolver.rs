//! P2P-first content resolution with gateway fallback.
//!
//! One call to [`Resolver::resolve`] is one fetch. It moves through
//!
//! ```text
//! CacheCheck → Discovering → Racing ⇄ Verifying → Complete
//!                   │           │
//!                   └──────→ GatewayFallback ⇄ Verifying → Complete
//!                                              (any) → Failed
//! ```
//!
//! Providers are tried as they are discovered, at most
//! `peerConcurrencyCap` at a time. Once there is a queue the best
//! [`PeerScore`] goes first, then the lowest
//! measured RTT. Peers that have served unverifiable bytes wait until
//! discovery has nothing else to offer. The fallback timer starts with discovery; when it fires, or as
//! soon as no peer path remains, the gateways are tried in order. Peers
//! already in flight keep racing while the gateway request runs.
//!
//! The first delivery that verifies wins. Every other attempt is cancelled
//! through the fetch's [`CancelScope`], given `cancelGraceMs` to close its
//! session, then dropped (dropping a session force-closes it).
//!
//! Verification failures are handled by source: a peer that lies is
//! discarded and the race continues, while a gateway that returns the
//! wrong bytes fails the fetch with [`ResolveError::IntegrityFailure`].
//!
//! [`Resolver::publish`] is the inverse: local bytes are sealed under their
//! derived identifier, cached with a local origin and announced.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use codio_core::{
    seal_content, verify_content, CacheStats, CidError, ContentCache, ContentId, ContentSource,
    PutOutcome, VerifiedContent,
};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use futures_timer::Delay;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::cancel::{CancelScope, CancelToken};
use crate::config::{ConfigError, ResolverConfig};
use crate::directory::{DhtBackend, ProviderDirectory, ProviderRecord, ProviderStream};
use crate::gateway::{gateway_url, Gateway, GatewayError};
use crate::score::{PeerScore, PeerScores};
use crate::session::{PeerConnector, PeerSession, SessionConfig, SignalingChannel, TransportError};
use crate::{boxed_future, with_timeout, BoxedFuture};

/// Which sources a fetch may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackPolicy {
    /// Peers first, gateways when the fallback timer fires.
    #[default]
    Race,
    /// Never contact a gateway.
    PeersOnly,
    /// Skip discovery and go straight to the gateways.
    GatewayOnly,
}

/// Per-fetch options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolveOptions {
    /// Overall deadline. Falls back to `resolveDeadlineMs`.
    pub deadline_ms: Option<u64>,
    pub fallback: FallbackPolicy,
}

impl ResolveOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchPhase {
    CacheCheck,
    Discovering,
    Racing,
    GatewayFallback,
    Verifying,
    Complete,
    Failed,
}

/// A source that was tried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceKind {
    Directory,
    Peer { peer: String },
    Gateway { endpoint: String },
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Directory => f.write_str("directory"),
            SourceKind::Peer { peer } => write!(f, "peer {}", peer),
            SourceKind::Gateway { endpoint } => write!(f, "gateway {}", endpoint),
        }
    }
}

/// Why one source did not deliver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum SourceFailure {
    #[error("no providers found")]
    NoProvidersFound,

    #[error("connection failed ({reason})")]
    ConnectionFailed { reason: &'static str },

    #[error("content failed verification")]
    IntegrityFailure,

    #[error("gateway unavailable ({reason})")]
    GatewayUnavailable {
        reason: &'static str,
        status: Option<u16>,
    },

    #[error("cancelled")]
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptedSource {
    pub source: SourceKind,
    pub failure: SourceFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    /// Every permitted source was tried and none delivered.
    AllSourcesExhausted,
    /// The fetch deadline passed first.
    DeadlineExceeded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AllSourcesExhausted => f.write_str("all sources exhausted"),
            FailureReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("invalid content identifier {input:?}: {reason}")]
    InvalidIdentifier { input: String, reason: CidError },

    #[error("gateway {endpoint} returned content that does not match {cid}")]
    IntegrityFailure {
        cid: ContentId,
        endpoint: String,
        attempted: Vec<AttemptedSource>,
    },

    #[error("could not resolve {cid}: {reason}")]
    ResolutionFailed {
        cid: ContentId,
        reason: FailureReason,
        attempted: Vec<AttemptedSource>,
    },

    #[error("resolver has been shut down")]
    ShutDown,
}

impl ResolveError {
    /// Stable code for the interception boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::InvalidIdentifier { .. } => "invalidIdentifier",
            ResolveError::IntegrityFailure { .. } => "integrityFailure",
            ResolveError::ResolutionFailed {
                reason: FailureReason::DeadlineExceeded,
                ..
            } => "deadlineExceeded",
            ResolveError::ResolutionFailed { .. } => "resolutionFailed",
            ResolveError::ShutDown => "shutDown",
        }
    }

    pub fn cid(&self) -> Option<&ContentId> {
        match self {
            ResolveError::IntegrityFailure { cid, .. } | ResolveError::ResolutionFailed { cid, .. } => {
                Some(cid)
            }
            ResolveError::InvalidIdentifier { .. } | ResolveError::ShutDown => None,
        }
    }

    pub fn attempted(&self) -> &[AttemptedSource] {
        match self {
            ResolveError::IntegrityFailure { attempted, .. }
            | ResolveError::ResolutionFailed { attempted, .. } => attempted,
            ResolveError::InvalidIdentifier { .. } | ResolveError::ShutDown => &[],
        }
    }
}

/// Why [`Resolver::publish`] refused some bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("content is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("content is {size} bytes, over the {budget} byte cache budget")]
    ExceedsCache { size: usize, budget: usize },

    #[error("resolver has been shut down")]
    ShutDown,
}

impl PublishError {
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::TooLarge { .. } => "tooLarge",
            PublishError::ExceedsCache { .. } => "exceedsCache",
            PublishError::ShutDown => "shutDown",
        }
    }
}

/// A successful fetch.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub content: VerifiedContent,
    /// Where the bytes came from. For a cache hit, the original source.
    pub source: ContentSource,
    pub from_cache: bool,
    /// Sources that were tried and did not deliver.
    pub attempts: Vec<AttemptedSource>,
}

impl Resolution {
    pub fn cid(&self) -> &ContentId {
        self.content.cid()
    }

    pub fn bytes(&self) -> &[u8] {
        self.content.bytes()
    }
}

/// State shared by every fetch of one resolver: the cache, the global peer
/// session slots, peer scores and the shutdown signal.
pub struct ResolverContext {
    cache: Arc<ContentCache>,
    peer_slots: Arc<Semaphore>,
    scores: PeerScores,
    shutdown: CancelScope,
}

impl ResolverContext {
    pub fn new(cache_byte_budget: usize, peer_concurrency_cap: usize) -> Self {
        Self {
            cache: Arc::new(ContentCache::new(cache_byte_budget)),
            peer_slots: Arc::new(Semaphore::new(peer_concurrency_cap)),
            scores: PeerScores::new(),
            shutdown: CancelScope::new(),
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn scores(&self) -> &PeerScores {
        &self.scores
    }

    /// Peer session slots not currently held by any fetch.
    pub fn available_peer_slots(&self) -> usize {
        self.peer_slots.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn shutdown_token(&self) -> CancelToken {
        self.shutdown.token()
    }

    /// Cancel in-flight fetches, refuse new ones and drop cached content
    /// and peer scores.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.peer_slots.close();
        self.cache.clear();
        self.scores.clear();
        info!("Resolver shut down");
    }
}

/// Resolves identifiers to verified content.
pub struct Resolver {
    config: ResolverConfig,
    context: Arc<ResolverContext>,
    directory: ProviderDirectory,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingChannel>,
    gateway: Arc<dyn Gateway>,
}

impl Resolver {
    pub fn new(
        config: ResolverConfig,
        dht: Arc<dyn DhtBackend>,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingChannel>,
        gateway: Arc<dyn Gateway>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let context = Arc::new(ResolverContext::new(
            config.cache_byte_budget,
            config.peer_concurrency_cap,
        ));
        info!(
            gateway = %config.gateway_endpoint,
            fallback_gateways = config.fallback_gateways.len(),
            peer_cap = config.peer_concurrency_cap,
            fallback_timeout_ms = config.fallback_timeout_ms,
            "Resolver initialised"
        );
        Ok(Self {
            directory: ProviderDirectory::new(dht, config.address_cache_ttl()),
            config,
            context,
            connector,
            signaling,
            gateway,
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ResolverContext> {
        &self.context
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.context.cache.stats()
    }

    pub fn shutdown(&self) {
        self.context.shutdown();
        self.directory.address_cache().clear();
    }

    /// Resolve `identifier` to verified bytes.
    ///
    /// Malformed identifiers fail before any network activity. A cache hit
    /// returns immediately with the source the content was first fetched
    /// from.
    #[instrument(skip(self, options), fields(cid = %identifier))]
    pub async fn resolve(
        &self,
        identifier: &str,
        options: ResolveOptions,
    ) -> Result<Resolution, ResolveError> {
        if self.context.is_shut_down() {
            return Err(ResolveError::ShutDown);
        }
        let cid = ContentId::parse(identifier).map_err(|reason| {
            debug!(error = %reason, "Rejected identifier");
            ResolveError::InvalidIdentifier {
                input: identifier.to_string(),
                reason,
            }
        })?;

        if let Some(hit) = self.context.cache.get(&cid) {
            debug!(origin = %hit.origin, "Cache hit");
            return Ok(Resolution {
                content: hit.content,
                source: hit.origin,
                from_cache: true,
                attempts: Vec::new(),
            });
        }

        let deadline = options
            .deadline()
            .unwrap_or_else(|| self.config.resolve_deadline());
        let mut fetch = Fetch::new(self, cid, options.fallback);
        let outcome = fetch.run(deadline).await;
        fetch.wind_down().await;

        let winner = outcome?;
        fetch.transition(FetchPhase::Complete);
        info!(source = %winner.source, bytes = winner.content.len(), "Resolved");

        let put = self
            .context
            .cache
            .put(winner.content.clone(), winner.source.clone());
        trace!(outcome = ?put, "Cached");

        Ok(Resolution {
            content: winner.content,
            source: winner.source,
            from_cache: false,
            attempts: fetch.failures,
        })
    }

    /// Make `bytes` available from this node.
    ///
    /// The identifier is derived from the bytes and the content is cached
    /// with a [`ContentSource::Local`] origin, so resolving it afterwards is
    /// a cache hit. The node is then announced as a provider; a failed
    /// announcement is logged and does not fail the publish.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn publish(&self, bytes: Vec<u8>) -> Result<ContentId, PublishError> {
        if self.context.is_shut_down() {
            return Err(PublishError::ShutDown);
        }
        let size = bytes.len();
        if size > self.config.max_content_size {
            return Err(PublishError::TooLarge {
                size,
                limit: self.config.max_content_size,
            });
        }

        let content = seal_content(bytes);
        let cid = content.cid().clone();
        if let PutOutcome::Rejected { size, budget } =
            self.context.cache.put(content, ContentSource::Local)
        {
            return Err(PublishError::ExceedsCache { size, budget });
        }
        info!(%cid, size, "Published");

        if let Err(e) = self
            .directory
            .announce(&cid, self.config.provider_timeout())
            .await
        {
            warn!(%cid, error = %e, "Provider announcement failed");
        }
        Ok(cid)
    }
}

struct Winner {
    content: VerifiedContent,
    source: ContentSource,
}

enum SourceOutcome {
    Peer {
        peer_id: PeerId,
        peer: String,
        result: Result<Vec<u8>, SourceFailure>,
    },
    Gateway {
        failures: Vec<AttemptedSource>,
        delivered: Option<(String, Vec<u8>)>,
    },
}

/// One in-progress fetch.
struct Fetch<'r> {
    resolver: &'r Resolver,
    cid: ContentId,
    policy: FallbackPolicy,
    phase: FetchPhase,
    scope: CancelScope,
    attempts: FuturesUnordered<BoxedFuture<SourceOutcome>>,
    candidates: Vec<ProviderRecord>,
    peers_in_flight: usize,
    providers_seen: usize,
    gateway_started: bool,
    gateway_done: bool,
    failures: Vec<AttemptedSource>,
}

impl<'r> Fetch<'r> {
    fn new(resolver: &'r Resolver, cid: ContentId, policy: FallbackPolicy) -> Self {
        Self {
            resolver,
            cid,
            policy,
            phase: FetchPhase::CacheCheck,
            scope: CancelScope::new(),
            attempts: FuturesUnordered::new(),
            candidates: Vec::new(),
            peers_in_flight: 0,
            providers_seen: 0,
            gateway_started: false,
            gateway_done: false,
            failures: Vec::new(),
        }
    }

    fn transition(&mut self, next: FetchPhase) {
        if self.phase != next {
            trace!(from = ?self.phase, to = ?next, "Fetch phase");
            self.phase = next;
        }
    }

    async fn run(&mut self, deadline: Duration) -> Result<Winner, ResolveError> {
        let resolver = self.resolver;
        let config = &resolver.config;
        let shutdown = resolver.context.shutdown_token();
        let mut deadline = Delay::new(deadline);
        let mut fallback_timer = Delay::new(config.fallback_timeout());

        let mut providers: Option<ProviderStream> = None;
        if self.policy == FallbackPolicy::GatewayOnly {
            self.start_gateway();
        } else {
            self.transition(FetchPhase::Discovering);
            providers = Some(resolver.directory.find_providers(
                &self.cid,
                config.max_providers,
                config.provider_timeout(),
            ));
        }

        loop {
            let discovery_done = providers.is_none();
            self.fill_peer_slots(discovery_done);
            if self.peer_path_exhausted(discovery_done)
                && self.policy == FallbackPolicy::Race
                && !self.gateway_started
            {
                debug!(providers = self.providers_seen, "No peer path left, trying gateway");
                self.start_gateway();
            }
            if self.exhausted(discovery_done) {
                return Err(self.failed(FailureReason::AllSourcesExhausted));
            }
            let fallback_armed = self.policy == FallbackPolicy::Race && !self.gateway_started;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ResolveError::ShutDown),
                _ = &mut deadline => {
                    warn!(cid = %self.cid, "Fetch deadline exceeded");
                    return Err(self.failed(FailureReason::DeadlineExceeded));
                }
                Some(outcome) = self.attempts.next(), if !self.attempts.is_empty() => {
                    if let Some(done) = self.on_outcome(outcome) {
                        return done;
                    }
                }
                record = next_provider(&mut providers), if providers.is_some() => match record {
                    Some(record) => self.on_provider(record),
                    None => {
                        providers = None;
                        self.on_discovery_end();
                    }
                },
                _ = &mut fallback_timer, if fallback_armed => {
                    info!(cid = %self.cid, in_flight = self.peers_in_flight, "Fallback timer elapsed, trying gateway");
                    self.start_gateway();
                }
            }
        }
    }

    fn peer_path_exhausted(&self, discovery_done: bool) -> bool {
        discovery_done && self.peers_in_flight == 0 && self.candidates.is_empty()
    }

    fn exhausted(&self, discovery_done: bool) -> bool {
        let gateway_finished = match self.policy {
            FallbackPolicy::PeersOnly => true,
            FallbackPolicy::Race | FallbackPolicy::GatewayOnly => self.gateway_done,
        };
        self.peer_path_exhausted(discovery_done) && gateway_finished
    }

    fn on_provider(&mut self, record: ProviderRecord) {
        self.providers_seen += 1;
        if self.phase == FetchPhase::Discovering {
            self.transition(FetchPhase::Racing);
        }
        trace!(peer = %record.peer, rtt = ?record.rtt_estimate, "Provider discovered");
        self.candidates.push(record);
    }

    fn on_discovery_end(&mut self) {
        debug!(cid = %self.cid, providers = self.providers_seen, "Discovery finished");
        if self.providers_seen == 0 {
            self.failures.push(AttemptedSource {
                source: SourceKind::Directory,
                failure: SourceFailure::NoProvidersFound,
            });
        }
    }

    fn launch_peer(&mut self, record: ProviderRecord) {
        self.peers_in_flight += 1;
        let attempt = PeerAttempt {
            cid: self.cid.clone(),
            record,
            connector: Arc::clone(&self.resolver.connector),
            signaling: Arc::clone(&self.resolver.signaling),
            slots: Arc::clone(&self.resolver.context.peer_slots),
            session: self.resolver.config.session_config(),
            token: self.scope.token(),
        };
        self.attempts.push(boxed_future(attempt.run()));
    }

    /// Launch queued providers, best first, until the concurrency cap is
    /// reached. Suspect peers are only launched once discovery is done.
    fn fill_peer_slots(&mut self, discovery_done: bool) {
        let resolver = self.resolver;
        let scores = &resolver.context.scores;
        while self.peers_in_flight < resolver.config.peer_concurrency_cap {
            let ranked: Vec<_> = self
                .candidates
                .iter()
                .map(|record| (scores.get(&record.peer.peer_id), record.rtt_estimate))
                .collect();
            let best = ranked
                .iter()
                .enumerate()
                .filter(|(_, (score, _))| discovery_done || !score.is_suspect())
                .min_by(|(_, a), (_, b)| candidate_order(a, b))
                .map(|(index, _)| index);
            let Some(index) = best else {
                return;
            };
            let record = self.candidates.remove(index);
            self.launch_peer(record);
        }
    }

    fn start_gateway(&mut self) {
        if self.gateway_started || self.policy == FallbackPolicy::PeersOnly {
            return;
        }
        self.gateway_started = true;
        self.transition(FetchPhase::GatewayFallback);
        let resolver = self.resolver;
        let config = &resolver.config;
        let attempt = GatewayAttempt {
            gateway: Arc::clone(&resolver.gateway),
            endpoints: config.gateway_endpoints().map(str::to_owned).collect(),
            cid: self.cid.to_string(),
            timeout: config.gateway_timeout(),
            max_content_size: config.max_content_size,
            token: self.scope.token(),
        };
        self.attempts.push(boxed_future(attempt.run()));
    }

    fn on_outcome(&mut self, outcome: SourceOutcome) -> Option<Result<Winner, ResolveError>> {
        match outcome {
            SourceOutcome::Peer {
                peer_id,
                peer,
                result,
            } => {
                self.peers_in_flight -= 1;
                let resolver = self.resolver;
                let scores = &resolver.context.scores;
                match result {
                    Ok(bytes) => {
                        self.transition(FetchPhase::Verifying);
                        match verify_content(&self.cid, bytes) {
                            Ok(content) => {
                                scores.record_delivered(peer_id);
                                return Some(Ok(Winner {
                                    content,
                                    source: ContentSource::P2p { peer },
                                }))
                            }
                            Err(e) => {
                                warn!(%peer, error = %e, "Peer content failed verification, discarding peer");
                                scores.record_invalid(peer_id);
                                self.failures.push(AttemptedSource {
                                    source: SourceKind::Peer { peer },
                                    failure: SourceFailure::IntegrityFailure,
                                });
                            }
                        }
                    }
                    Err(failure) => {
                        debug!(%peer, %failure, "Peer attempt failed");
                        if failure != SourceFailure::Cancelled {
                            scores.record_failed(peer_id);
                        }
                        self.failures.push(AttemptedSource {
                            source: SourceKind::Peer { peer },
                            failure,
                        });
                    }
                }
                self.transition(if self.gateway_started {
                    FetchPhase::GatewayFallback
                } else {
                    FetchPhase::Racing
                });
                None
            }
            SourceOutcome::Gateway {
                failures,
                delivered,
            } => {
                self.gateway_done = true;
                self.failures.extend(failures);
                let (endpoint, bytes) = delivered?;
                self.transition(FetchPhase::Verifying);
                match verify_content(&self.cid, bytes) {
                    Ok(content) => Some(Ok(Winner {
                        content,
                        source: ContentSource::Gateway { endpoint },
                    })),
                    Err(e) => {
                        error!(%endpoint, error = %e, "Gateway content failed verification");
                        self.failures.push(AttemptedSource {
                            source: SourceKind::Gateway {
                                endpoint: endpoint.clone(),
                            },
                            failure: SourceFailure::IntegrityFailure,
                        });
                        self.transition(FetchPhase::Failed);
                        Some(Err(ResolveError::IntegrityFailure {
                            cid: self.cid.clone(),
                            endpoint,
                            attempted: self.failures.clone(),
                        }))
                    }
                }
            }
        }
    }

    fn failed(&mut self, reason: FailureReason) -> ResolveError {
        self.transition(FetchPhase::Failed);
        ResolveError::ResolutionFailed {
            cid: self.cid.clone(),
            reason,
            attempted: self.failures.clone(),
        }
    }

    /// Cancel whatever is still running, wait up to the grace period for
    /// sessions to close, then drop the rest.
    async fn wind_down(&mut self) {
        self.scope.cancel();
        if self.attempts.is_empty() {
            return;
        }
        let in_flight = self.attempts.len();
        let attempts = &mut self.attempts;
        let failures = &mut self.failures;
        let resolver = self.resolver;
        let scores = &resolver.context.scores;
        let drained = with_timeout(resolver.config.cancel_grace(), async {
            while let Some(outcome) = attempts.next().await {
                match outcome {
                    SourceOutcome::Peer {
                        peer_id,
                        peer,
                        result,
                    } => {
                        let failure = result.err().unwrap_or(SourceFailure::Cancelled);
                        if failure != SourceFailure::Cancelled {
                            scores.record_failed(peer_id);
                        }
                        failures.push(AttemptedSource {
                            source: SourceKind::Peer { peer },
                            failure,
                        });
                    }
                    SourceOutcome::Gateway { failures: more, .. } => failures.extend(more),
                }
            }
        })
        .await;

        if drained.is_none() {
            warn!(
                remaining = self.attempts.len(),
                "Attempts still running after grace period, force-closing"
            );
        } else {
            debug!(in_flight, "Cancelled remaining attempts");
        }
        self.attempts = FuturesUnordered::new();
    }
}

/// Higher reputation first, then lower RTT. Unmeasured RTTs go last and
/// ties keep discovery order.
fn candidate_order(
    (a_score, a_rtt): &(PeerScore, Option<Duration>),
    (b_score, b_rtt): &(PeerScore, Option<Duration>),
) -> Ordering {
    b_score
        .reputation()
        .total_cmp(&a_score.reputation())
        .then_with(|| a_rtt.unwrap_or(Duration::MAX).cmp(&b_rtt.unwrap_or(Duration::MAX)))
}

async fn next_provider(providers: &mut Option<ProviderStream>) -> Option<ProviderRecord> {
    match providers {
        Some(stream) => stream.next().await,
        None => None,
    }
}

fn connection_failed(error: TransportError) -> SourceFailure {
    SourceFailure::ConnectionFailed {
        reason: error.code(),
    }
}

/// Negotiate with one provider and pull the object.
struct PeerAttempt {
    cid: ContentId,
    record: ProviderRecord,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingChannel>,
    slots: Arc<Semaphore>,
    session: SessionConfig,
    token: CancelToken,
}

impl PeerAttempt {
    async fn run(self) -> SourceOutcome {
        let peer_id = self.record.peer.peer_id;
        let peer = peer_id.to_string();
        let result = self.fetch().await;
        SourceOutcome::Peer {
            peer_id,
            peer,
            result,
        }
    }

    async fn fetch(&self) -> Result<Vec<u8>, SourceFailure> {
        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(SourceFailure::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => permit.map_err(|_| SourceFailure::ConnectionFailed {
                reason: "resolver_shut_down",
            })?,
        };

        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(SourceFailure::Cancelled),
            opened = PeerSession::open(
                self.record.peer.clone(),
                self.connector.as_ref(),
                self.signaling.as_ref(),
                self.session.clone(),
            ) => opened,
        };
        let mut session = opened.map_err(|e| {
            debug!(peer = %self.record.peer, error = %e, "Session negotiation failed");
            connection_failed(e)
        })?;

        let result = self.transfer(&mut session).await;
        session.close();
        result
    }

    async fn transfer(&self, session: &mut PeerSession) -> Result<Vec<u8>, SourceFailure> {
        let mut transfer = session
            .request_content(&self.cid)
            .await
            .map_err(connection_failed)?;
        let mut data = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                chunk = transfer.next_chunk() => Some(chunk),
            };
            match next {
                None => {
                    transfer.cancel().await;
                    return Err(SourceFailure::Cancelled);
                }
                Some(Ok(Some(chunk))) => data.extend_from_slice(&chunk),
                Some(Ok(None)) => return Ok(data),
                Some(Err(e)) => return Err(connection_failed(e)),
            }
        }
    }
}

/// Try each gateway once, in order, until one returns a body.
struct GatewayAttempt {
    gateway: Arc<dyn Gateway>,
    endpoints: Vec<String>,
    cid: String,
    timeout: Duration,
    max_content_size: usize,
    token: CancelToken,
}

impl GatewayAttempt {
    async fn run(self) -> SourceOutcome {
        let mut failures = Vec::new();
        for endpoint in &self.endpoints {
            let url = gateway_url(endpoint, &self.cid);
            debug!(%url, "Requesting from gateway");

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    failures.push(AttemptedSource {
                        source: SourceKind::Gateway { endpoint: endpoint.clone() },
                        failure: SourceFailure::Cancelled,
                    });
                    return SourceOutcome::Gateway { failures, delivered: None };
                }
                result = with_timeout(self.timeout, self.gateway.get(&url)) => {
                    result.unwrap_or(Err(GatewayError::Timeout))
                }
            };

            let result = result.and_then(|body| {
                if body.len() > self.max_content_size {
                    Err(GatewayError::TooLarge {
                        limit: self.max_content_size,
                    })
                } else {
                    Ok(body)
                }
            });

            match result {
                Ok(body) => {
                    return SourceOutcome::Gateway {
                        failures,
                        delivered: Some((endpoint.clone(), body)),
                    }
                }
                Err(e) => {
                    warn!(%endpoint, error = %e, "Gateway unavailable");
                    let status = match e {
                        GatewayError::Status { status } => Some(status),
                        _ => None,
                    };
                    failures.push(AttemptedSource {
                        source: SourceKind::Gateway {
                            endpoint: endpoint.clone(),
                        },
                        failure: SourceFailure::GatewayUnavailable {
                            reason: e.code(),
                            status,
                        },
                    });
                }
            }
        }
        SourceOutcome::Gateway {
            failures,
            delivered: None,
        }
    }
}
