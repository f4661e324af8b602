//! # Codio P2P
//!
//! Networking layer for the Codio hybrid CDN client. Resolves a content
//! identifier to verified bytes, preferring peers and falling back to HTTP
//! gateways.
//!
//! ## Architecture
//!
//! - **Directory** ([`directory`], [`kad`]): Kademlia provider lookups,
//!   streamed as they arrive so a fetch can start on the first provider.
//! - **Sessions** ([`session`]): one WebRTC data channel per provider,
//!   negotiated through a signaling relay and carrying the
//!   [`codio_core::wire`] frame protocol.
//! - **Gateway** ([`gateway`]): plain HTTP GET against content-addressed
//!   endpoints.
//! - **Resolver** ([`resolver`]): races peer sessions under a concurrency
//!   cap, verifies the winner, falls back to gateways on a timer, and
//!   caches the result. Content published locally is verified, cached and
//!   announced.
//! - **Scores** ([`score`]): per-peer delivery record used to order
//!   providers.
//!
//! ## Trust Model
//!
//! Neither peers nor gateways are trusted. Every delivered object is
//! re-hashed by `codio-core` before it is returned or cached. The signaling
//! relay only ever sees session descriptions, never content.
//!
//! All collaborators sit behind traits so the same resolver drives the
//! browser adapters (in `codio-wasm`) and in-memory test doubles.

pub mod behaviour;
pub mod cancel;
pub mod config;
pub mod directory;
pub mod gateway;
pub mod kad;
pub mod resolver;
pub mod score;
pub mod session;

#[cfg(target_arch = "wasm32")]
pub mod webrtc;

pub use cancel::{CancelScope, CancelToken};
pub use config::{ConfigError, ResolverConfig};
pub use directory::{
    DhtBackend, DhtProviderEvent, DirectoryError, PeerAddress, ProviderAddressCache,
    ProviderDirectory, ProviderRecord, ProviderStream,
};
pub use gateway::{gateway_url, Gateway, GatewayError};
pub use resolver::{
    AttemptedSource, FailureReason, FallbackPolicy, FetchPhase, Resolution, ResolveError,
    PublishError, ResolveOptions, Resolver, ResolverContext, SourceFailure, SourceKind,
};
pub use score::{PeerScore, PeerScores};
pub use session::{
    DataChannel, PeerConnector, PeerSession, PendingChannel, PendingConnection, SdpKind,
    SessionConfig, SessionDescription, SessionState, SignalingChannel, Transfer, TransportError,
};

#[cfg(not(target_arch = "wasm32"))]
pub use gateway::HttpGateway;

#[cfg(target_arch = "wasm32")]
pub use webrtc::WebRtcConnector;

use std::future::Future;
use std::time::Duration;

use futures::future::Either;

/// `Send` natively, nothing in the browser where JS handles are `!Send`.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSend: Send {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + ?Sized> MaybeSend for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSend for T {}

/// `Sync` natively, nothing in the browser.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSync: Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Sync + ?Sized> MaybeSync for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSync {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSync for T {}

#[cfg(not(target_arch = "wasm32"))]
pub type BoxedStream<T> = futures::stream::BoxStream<'static, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxedStream<T> = futures::stream::LocalBoxStream<'static, T>;

#[cfg(not(target_arch = "wasm32"))]
pub(crate) type BoxedFuture<T> = futures::future::BoxFuture<'static, T>;
#[cfg(target_arch = "wasm32")]
pub(crate) type BoxedFuture<T> = futures::future::LocalBoxFuture<'static, T>;

#[cfg(not(target_arch = "wasm32"))]
pub fn boxed_stream<S>(stream: S) -> BoxedStream<S::Item>
where
    S: futures::Stream + Send + 'static,
{
    use futures::StreamExt;
    stream.boxed()
}

#[cfg(target_arch = "wasm32")]
pub fn boxed_stream<S>(stream: S) -> BoxedStream<S::Item>
where
    S: futures::Stream + 'static,
{
    use futures::StreamExt;
    stream.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn boxed_future<F>(future: F) -> BoxedFuture<F::Output>
where
    F: Future + Send + 'static,
{
    use futures::FutureExt;
    future.boxed()
}

#[cfg(target_arch = "wasm32")]
pub(crate) fn boxed_future<F>(future: F) -> BoxedFuture<F::Output>
where
    F: Future + 'static,
{
    use futures::FutureExt;
    future.boxed_local()
}

/// Run `future` for at most `after`. `None` means the timer won.
pub(crate) async fn with_timeout<F: Future>(after: Duration, future: F) -> Option<F::Output> {
    let future = std::pin::pin!(future);
    match futures::future::select(future, futures_timer::Delay::new(after)).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}
