//! JavaScript-backed directory and signaling.
//!
//! The host page owns the DHT node and the signaling relay. It hands Codio
//! two functions:
//!
//! - `findProviders(key: Uint8Array, onProvider: (entry) => void) => Promise<ProviderEntry[] | void>`
//! - `signal(peerId: string, offer: {type, sdp}) => Promise<{type, sdp}>`
//!
//! `findProviders` should call `onProvider` for each provider as the DHT
//! walk finds it and settle its promise when the walk is over. Entries in
//! the resolved array are reported too, for pages that only have a batch
//! answer. `onProvider` must not be called after the promise settles.
//!
//! Provider entries are plain objects and are validated here before they
//! reach the resolver.

use std::time::Duration;

use codio_p2p::DhtProviderEvent;
use libp2p::{Multiaddr, PeerId};
use serde::Deserialize;

/// One provider as reported by the host page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    pub peer_id: String,
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub rtt_ms: Option<u64>,
}

impl ProviderEntry {
    /// `None` if the peer id does not parse. Unparseable addresses are
    /// dropped individually.
    pub fn into_event(self) -> Option<DhtProviderEvent> {
        let peer: PeerId = match self.peer_id.parse() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::debug!(peer_id = %self.peer_id, error = %e, "Ignoring provider with bad peer id");
                return None;
            }
        };
        let addresses = self
            .addrs
            .iter()
            .filter_map(|addr| addr.parse::<Multiaddr>().ok())
            .collect();
        Some(DhtProviderEvent {
            peer,
            addresses,
            rtt: self.rtt_ms.map(Duration::from_millis),
        })
    }
}

#[cfg(target_arch = "wasm32")]
pub use self::js::{JsDht, JsSignaling};

#[cfg(target_arch = "wasm32")]
mod js {
    use async_trait::async_trait;
    use codio_p2p::{
        boxed_stream, BoxedStream, DhtBackend, DhtProviderEvent, DirectoryError, PeerAddress,
        SessionDescription, SignalingChannel, TransportError,
    };
    use futures::channel::mpsc;
    use futures::{future, stream, StreamExt};
    use js_sys::{Function, Promise, Uint8Array};
    use libp2p::kad::RecordKey;
    use tracing::debug;
    use wasm_bindgen::closure::Closure;
    use wasm_bindgen::{JsCast, JsValue};
    use wasm_bindgen_futures::JsFuture;

    use super::ProviderEntry;

    async fn call_async(func: &Function, args: &[&JsValue]) -> Result<JsValue, JsValue> {
        let returned = match args {
            [a] => func.call1(&JsValue::NULL, a)?,
            [a, b] => func.call2(&JsValue::NULL, a, b)?,
            _ => func.call0(&JsValue::NULL)?,
        };
        match returned.dyn_into::<Promise>() {
            Ok(promise) => JsFuture::from(promise).await,
            Err(value) => Ok(value),
        }
    }

    fn describe(value: &JsValue) -> String {
        value
            .as_string()
            .unwrap_or_else(|| format!("{:?}", value))
    }

    /// Provider lookups delegated to a JS function.
    pub struct JsDht {
        find_providers: Function,
    }

    impl JsDht {
        pub fn new(find_providers: Function) -> Self {
            Self { find_providers }
        }
    }

    #[async_trait(?Send)]
    impl DhtBackend for JsDht {
        async fn lookup(
            &self,
            key: RecordKey,
        ) -> Result<BoxedStream<DhtProviderEvent>, DirectoryError> {
            let (tx, rx) = mpsc::unbounded::<DhtProviderEvent>();

            let pushed = tx.clone();
            let on_provider = Closure::<dyn FnMut(JsValue)>::new(move |value: JsValue| {
                match serde_wasm_bindgen::from_value::<ProviderEntry>(value) {
                    Ok(entry) => {
                        if let Some(event) = entry.into_event() {
                            let _ = pushed.unbounded_send(event);
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring malformed provider entry"),
                }
            });

            let key: JsValue = Uint8Array::from(key.to_vec().as_slice()).into();
            let returned = self
                .find_providers
                .call2(&JsValue::NULL, &key, on_provider.as_ref())
                .map_err(|e| DirectoryError::Unavailable(describe(&e)))?;

            // Owns the callback until the page settles its promise. Dropping
            // both senders then ends the stream.
            let walk = async move {
                let settled = match returned.dyn_into::<Promise>() {
                    Ok(promise) => JsFuture::from(promise).await,
                    Err(value) => Ok(value),
                };
                match settled {
                    Ok(value) if value.is_undefined() || value.is_null() => {}
                    Ok(value) => match serde_wasm_bindgen::from_value::<Vec<ProviderEntry>>(value) {
                        Ok(entries) => {
                            for event in entries.into_iter().filter_map(ProviderEntry::into_event) {
                                let _ = tx.unbounded_send(event);
                            }
                        }
                        Err(e) => debug!(error = %e, "Ignoring malformed provider list"),
                    },
                    Err(e) => debug!(error = %describe(&e), "Provider lookup rejected"),
                }
                drop(on_provider);
            };
            let walk =
                stream::once(walk).filter_map(|()| future::ready(None::<DhtProviderEvent>));

            Ok(boxed_stream(stream::select(rx, walk)))
        }
    }

    /// Offer/answer relay delegated to a JS function.
    pub struct JsSignaling {
        signal: Function,
    }

    impl JsSignaling {
        pub fn new(signal: Function) -> Self {
            Self { signal }
        }
    }

    #[async_trait(?Send)]
    impl SignalingChannel for JsSignaling {
        async fn exchange(
            &self,
            peer: &PeerAddress,
            offer: SessionDescription,
        ) -> Result<SessionDescription, TransportError> {
            let offer = serde_wasm_bindgen::to_value(&offer)
                .map_err(|e| TransportError::connection(peer, e.to_string()))?;
            let peer_id = JsValue::from_str(&peer.peer_id.to_string());
            let answer = call_async(&self.signal, &[&peer_id, &offer])
                .await
                .map_err(|e| TransportError::connection(peer, describe(&e)))?;
            serde_wasm_bindgen::from_value(answer)
                .map_err(|e| TransportError::connection(peer, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_json() {
        let peer = PeerId::random();
        let json = format!(
            r#"{{"peerId":"{}","addrs":["/ip4/127.0.0.1/tcp/4001","nonsense"],"rttMs":42}}"#,
            peer
        );
        let entry: ProviderEntry = serde_json::from_str(&json).unwrap();
        let event = entry.into_event().unwrap();
        assert_eq!(event.peer, peer);
        assert_eq!(event.addresses.len(), 1);
        assert_eq!(event.rtt, Some(Duration::from_millis(42)));
    }

    #[test]
    fn test_entry_defaults() {
        let peer = PeerId::random();
        let entry: ProviderEntry =
            serde_json::from_str(&format!(r#"{{"peerId":"{}"}}"#, peer)).unwrap();
        let event = entry.into_event().unwrap();
        assert!(event.addresses.is_empty());
        assert_eq!(event.rtt, None);
    }

    #[test]
    fn test_bad_peer_id_is_dropped() {
        let entry = ProviderEntry {
            peer_id: "not-a-peer".to_string(),
            addrs: Vec::new(),
            rtt_ms: None,
        };
        assert!(entry.into_event().is_none());
    }
}
