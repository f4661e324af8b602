//! Browser WebRTC transport.
//!
//! Each session gets its own `RtcPeerConnection` with a single ordered data
//! channel named `codio`. Offers are sent once ICE gathering has finished,
//! so the signaling relay carries one complete description each way.

use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use js_sys::{Array, Object, Reflect, Uint8Array};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    MessageEvent, RtcConfiguration, RtcDataChannel, RtcDataChannelType, RtcPeerConnection,
    RtcPeerConnectionIceEvent, RtcSdpType, RtcSessionDescriptionInit,
};

use crate::directory::PeerAddress;
use crate::session::{
    DataChannel, PeerConnector, PendingChannel, PendingConnection, SessionDescription,
    TransportError,
};
use crate::with_timeout;

const CHANNEL_LABEL: &str = "codio";

/// Upper bound on ICE gathering before the offer is sent with whatever
/// candidates were found.
const GATHER_TIMEOUT: Duration = Duration::from_secs(3);

fn js_reason(value: &JsValue) -> String {
    value
        .as_string()
        .unwrap_or_else(|| format!("{:?}", value))
}

/// Creates outbound connections using the browser's WebRTC stack.
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> Result<RtcConfiguration, JsValue> {
        let servers = Array::new();
        for url in &self.ice_servers {
            let server = Object::new();
            Reflect::set(&server, &JsValue::from_str("urls"), &JsValue::from_str(url))?;
            servers.push(&server);
        }
        let config = RtcConfiguration::new();
        config.set_ice_servers(&servers);
        Ok(config)
    }
}

/// Event handlers must stay alive as long as the connection they are
/// registered on.
struct Handlers {
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_open: Closure<dyn FnMut(JsValue)>,
    _on_close: Closure<dyn FnMut(JsValue)>,
    _on_ice: Closure<dyn FnMut(RtcPeerConnectionIceEvent)>,
}

#[async_trait(?Send)]
impl PeerConnector for WebRtcConnector {
    async fn create_offer(&self, peer: &PeerAddress) -> Result<PendingConnection, TransportError> {
        let fail = |e: JsValue| TransportError::connection(peer, js_reason(&e));

        let config = self.configuration().map_err(fail)?;
        let pc = RtcPeerConnection::new_with_configuration(&config).map_err(fail)?;
        let channel = pc.create_data_channel(CHANNEL_LABEL);
        channel.set_binary_type(RtcDataChannelType::Arraybuffer);

        let (message_tx, inbound) = mpsc::unbounded::<Vec<u8>>();
        let on_message = {
            let tx = message_tx.clone();
            Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
                if let Ok(buf) = event.data().dyn_into::<js_sys::ArrayBuffer>() {
                    let _ = tx.unbounded_send(Uint8Array::new(&buf).to_vec());
                }
            })
        };
        let on_close = Closure::<dyn FnMut(JsValue)>::new(move |_event: JsValue| {
            message_tx.close_channel();
        });

        let (open_tx, opened) = mpsc::unbounded::<()>();
        let on_open = Closure::<dyn FnMut(JsValue)>::new(move |_event: JsValue| {
            let _ = open_tx.unbounded_send(());
        });

        let (ice_tx, mut gathered) = mpsc::unbounded::<()>();
        let on_ice = Closure::<dyn FnMut(RtcPeerConnectionIceEvent)>::new(
            move |event: RtcPeerConnectionIceEvent| {
                if event.candidate().is_none() {
                    let _ = ice_tx.unbounded_send(());
                }
            },
        );

        channel.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        channel.set_onopen(Some(on_open.as_ref().unchecked_ref()));
        channel.set_onclose(Some(on_close.as_ref().unchecked_ref()));
        pc.set_onicecandidate(Some(on_ice.as_ref().unchecked_ref()));

        let offer = JsFuture::from(pc.create_offer()).await.map_err(fail)?;
        let sdp = Reflect::get(&offer, &JsValue::from_str("sdp"))
            .map_err(fail)?
            .as_string()
            .ok_or_else(|| TransportError::connection(peer, "offer has no sdp"))?;
        let init = RtcSessionDescriptionInit::new(RtcSdpType::Offer);
        init.set_sdp(&sdp);
        JsFuture::from(pc.set_local_description(&init))
            .await
            .map_err(fail)?;

        if with_timeout(GATHER_TIMEOUT, gathered.next()).await.is_none() {
            tracing::debug!(peer = %peer, "ICE gathering timed out, sending partial offer");
        }
        let local = pc
            .local_description()
            .map(|desc| desc.sdp())
            .unwrap_or(sdp);

        let rtc = RtcChannel {
            pc,
            channel,
            inbound,
            closed: false,
            _handlers: Handlers {
                _on_message: on_message,
                _on_open: on_open,
                _on_close: on_close,
                _on_ice: on_ice,
            },
        };
        Ok(PendingConnection {
            offer: SessionDescription::offer(local),
            channel: Box::new(PendingRtc {
                peer: peer.clone(),
                rtc,
                opened,
            }),
        })
    }
}

struct PendingRtc {
    peer: PeerAddress,
    rtc: RtcChannel,
    opened: mpsc::UnboundedReceiver<()>,
}

#[async_trait(?Send)]
impl PendingChannel for PendingRtc {
    async fn complete(
        self: Box<Self>,
        answer: SessionDescription,
    ) -> Result<Box<dyn DataChannel>, TransportError> {
        let PendingRtc {
            peer,
            mut rtc,
            mut opened,
        } = *self;

        let init = RtcSessionDescriptionInit::new(RtcSdpType::Answer);
        init.set_sdp(&answer.sdp);
        if let Err(e) = JsFuture::from(rtc.pc.set_remote_description(&init)).await {
            rtc.close();
            return Err(TransportError::connection(&peer, js_reason(&e)));
        }

        // Timeout is enforced by the session around the whole negotiation.
        if opened.next().await.is_none() {
            rtc.close();
            return Err(TransportError::ChannelClosed);
        }
        Ok(Box::new(rtc))
    }
}

struct RtcChannel {
    pc: RtcPeerConnection,
    channel: RtcDataChannel,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: bool,
    _handlers: Handlers,
}

#[async_trait(?Send)]
impl DataChannel for RtcChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        self.channel
            .send_with_u8_array(&frame)
            .map_err(|e| TransportError::Send(js_reason(&e)))
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.next().await
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.channel.set_onmessage(None);
        self.channel.set_onopen(None);
        self.channel.set_onclose(None);
        self.pc.set_onicecandidate(None);
        self.channel.close();
        self.pc.close();
        self.inbound.close();
    }
}

impl Drop for RtcChannel {
    fn drop(&mut self) {
        self.close();
    }
}
