//! Peer transport sessions.
//!
//! A session is one direct data channel to one provider, used for at most
//! one transfer at a time. Opening it is an offer/answer exchange:
//!
//! ```text
//!  PeerConnector           SignalingChannel              remote peer
//!       |  create_offer          |                           |
//!       |----------------------->| exchange(offer) --------->|
//!       |                        |<--------- answer ---------|
//!       |  complete(answer)      |                           |
//!       |====================== data channel ================|
//! ```
//!
//! Once open, the requester sends `Request`, the peer streams `Chunk`
//! frames and ends with `Complete`. No integrity checking happens here;
//! the resolver verifies the reassembled object.
//!
//! ## States
//!
//! `Connecting → Open → Transferring → Open → … → Closing → Closed`, with
//! `Failed` reachable from any live state. [`PeerSession::close`] consumes
//! the session, so nothing can be sent on a closed one. Dropping a session
//! closes its channel too.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use codio_core::wire::{TransferMessage, WireError};
use codio_core::ContentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::directory::PeerAddress;
use crate::{with_timeout, MaybeSend, MaybeSync};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to {peer} failed: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    #[error("negotiation with {peer} timed out after {after_ms}ms")]
    NegotiationTimeout { peer: String, after_ms: u64 },

    #[error("peer closed the channel")]
    ChannelClosed,

    #[error("no frame received for {after_ms}ms")]
    Idle { after_ms: u64 },

    #[error("peer does not hold {cid}")]
    NotFound { cid: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("unexpected {frame} frame")]
    UnexpectedFrame { frame: &'static str },

    #[error("peer announced {expected} bytes but sent {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("content exceeds {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("send failed: {0}")]
    Send(String),

    #[error("session is {state}")]
    NotOpen { state: SessionState },
}

impl TransportError {
    pub fn connection(peer: &PeerAddress, reason: impl Into<String>) -> Self {
        TransportError::ConnectionFailed {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// Short stable code for failure reporting. Never carries transport
    /// internals.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::ConnectionFailed { .. } => "connection_failed",
            TransportError::NegotiationTimeout { .. } => "negotiation_timeout",
            TransportError::ChannelClosed => "channel_closed",
            TransportError::Idle { .. } => "idle_timeout",
            TransportError::NotFound { .. } => "not_found",
            TransportError::Protocol(_) => "protocol_error",
            TransportError::UnexpectedFrame { .. } => "unexpected_frame",
            TransportError::LengthMismatch { .. } => "length_mismatch",
            TransportError::TooLarge { .. } => "too_large",
            TransportError::Send(_) => "send_failed",
            TransportError::NotOpen { .. } => "not_open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description relayed through signaling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An established, ordered, reliable message channel to a peer.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait DataChannel: MaybeSend {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Next message, or `None` once the channel is closed.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// Close immediately. Must be safe to call more than once.
    fn close(&mut self);
}

/// Local half of a connection waiting for the remote answer.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait PendingChannel: MaybeSend {
    async fn complete(
        self: Box<Self>,
        answer: SessionDescription,
    ) -> Result<Box<dyn DataChannel>, TransportError>;
}

pub struct PendingConnection {
    pub offer: SessionDescription,
    pub channel: Box<dyn PendingChannel>,
}

/// Creates the local side of a connection (an `RTCPeerConnection` in the
/// browser).
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait PeerConnector: MaybeSend + MaybeSync {
    async fn create_offer(&self, peer: &PeerAddress) -> Result<PendingConnection, TransportError>;
}

/// Relays an offer to `peer` and returns its answer.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait SignalingChannel: MaybeSend + MaybeSync {
    async fn exchange(
        &self,
        peer: &PeerAddress,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Open,
    Transferring,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Transferring => "transferring",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub negotiation_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_content_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            max_content_size: 100 * 1024 * 1024,
        }
    }
}

/// An open session with one provider.
pub struct PeerSession {
    peer: PeerAddress,
    channel: Option<Box<dyn DataChannel>>,
    state: SessionState,
    config: SessionConfig,
}

impl PeerSession {
    /// Negotiate a data channel with `peer`. Every failure, including the
    /// negotiation timer running out, is a connection failure; nothing is
    /// left half-open.
    pub async fn open(
        peer: PeerAddress,
        connector: &dyn PeerConnector,
        signaling: &dyn SignalingChannel,
        config: SessionConfig,
    ) -> Result<Self, TransportError> {
        debug!(%peer, "Negotiating session");
        let negotiation = async {
            let pending = connector.create_offer(&peer).await?;
            let answer = signaling.exchange(&peer, pending.offer.clone()).await?;
            if answer.kind != SdpKind::Answer || answer.sdp.is_empty() {
                return Err(TransportError::connection(&peer, "signaling returned no answer"));
            }
            pending.channel.complete(answer).await
        };

        let channel = match with_timeout(config.negotiation_timeout, negotiation).await {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "Negotiation failed");
                return Err(match e {
                    TransportError::ConnectionFailed { .. } => e,
                    other => TransportError::connection(&peer, other.to_string()),
                });
            }
            None => {
                debug!(%peer, "Negotiation timed out");
                return Err(TransportError::NegotiationTimeout {
                    peer: peer.to_string(),
                    after_ms: config.negotiation_timeout.as_millis() as u64,
                });
            }
        };

        debug!(%peer, "Session open");
        Ok(Self {
            peer,
            channel: Some(channel),
            state: SessionState::Open,
            config,
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Ask the peer for `cid`. The returned [`Transfer`] yields its chunks.
    pub async fn request_content(&mut self, cid: &ContentId) -> Result<Transfer<'_>, TransportError> {
        if self.state != SessionState::Open {
            return Err(TransportError::NotOpen { state: self.state });
        }
        let frame = TransferMessage::Request { cid: cid.clone() }.encode();
        let sent = self.channel_mut()?.send(frame).await;
        if let Err(e) = sent {
            self.fail();
            return Err(e);
        }
        self.state = SessionState::Transferring;
        trace!(peer = %self.peer, cid = %cid, "Requested content");
        Ok(Transfer {
            session: self,
            cid: cid.clone(),
            received: 0,
            finished: false,
        })
    }

    /// Close the channel and consume the session.
    pub fn close(mut self) -> SessionState {
        self.shutdown();
        self.state
    }

    fn channel_mut(&mut self) -> Result<&mut Box<dyn DataChannel>, TransportError> {
        let state = self.state;
        self.channel
            .as_mut()
            .ok_or(TransportError::NotOpen { state })
    }

    fn shutdown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            self.state = SessionState::Closing;
            channel.close();
            self.state = SessionState::Closed;
            debug!(peer = %self.peer, "Session closed");
        }
    }

    fn fail(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.state = SessionState::Failed;
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer.to_string())
            .field("state", &self.state)
            .finish()
    }
}

/// One in-progress content transfer.
pub struct Transfer<'s> {
    session: &'s mut PeerSession,
    cid: ContentId,
    received: u64,
    finished: bool,
}

impl Transfer<'_> {
    /// Next chunk, `Ok(None)` once the peer has sent `Complete` and the
    /// length matched. Any error tears the session down.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.finished {
            return Ok(None);
        }
        let idle = self.session.config.idle_timeout;
        let channel = self.session.channel_mut()?;
        let polled = with_timeout(idle, channel.recv()).await;
        let frame = match polled {
            Some(Some(frame)) => frame,
            Some(None) => return Err(self.fail(TransportError::ChannelClosed)),
            None => {
                return Err(self.fail(TransportError::Idle {
                    after_ms: idle.as_millis() as u64,
                }))
            }
        };

        match TransferMessage::decode(&frame) {
            Ok(TransferMessage::Chunk { data }) => {
                self.received += data.len() as u64;
                let limit = self.session.config.max_content_size;
                if self.received > limit as u64 {
                    return Err(self.fail(TransportError::TooLarge { limit }));
                }
                Ok(Some(data))
            }
            Ok(TransferMessage::Complete { total_len }) => {
                if total_len != self.received {
                    return Err(self.fail(TransportError::LengthMismatch {
                        expected: total_len,
                        actual: self.received,
                    }));
                }
                self.finished = true;
                self.session.state = SessionState::Open;
                trace!(peer = %self.session.peer, cid = %self.cid, bytes = self.received, "Transfer complete");
                Ok(None)
            }
            Ok(TransferMessage::NotFound { .. }) => Err(self.fail(TransportError::NotFound {
                cid: self.cid.to_string(),
            })),
            Ok(other) => Err(self.fail(TransportError::UnexpectedFrame {
                frame: other.kind(),
            })),
            Err(e) => Err(self.fail(TransportError::Protocol(e))),
        }
    }

    /// Drain every chunk into one buffer.
    pub async fn collect(mut self) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Tell the peer to stop sending. Best effort; the session is left
    /// for the caller to close.
    pub async fn cancel(self) {
        if self.finished {
            return;
        }
        let frame = TransferMessage::Cancel.encode();
        let sent = match self.session.channel_mut() {
            Ok(channel) => channel.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            trace!(peer = %self.session.peer, error = %e, "Cancel frame not delivered");
        }
        self.session.state = SessionState::Closing;
    }

    fn fail(&mut self, error: TransportError) -> TransportError {
        warn!(peer = %self.session.peer, cid = %self.cid, error = %error, "Transfer failed");
        self.session.fail();
        error
    }
}
