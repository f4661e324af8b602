//! # Codio WASM
//!
//! WebAssembly bindings for the Codio hybrid CDN client. A service worker
//! intercepts requests for content-addressed resources and hands the
//! identifier to [`CodioClient::resolve`], which tries peers over WebRTC
//! first and falls back to HTTP gateways.
//!
//! The page supplies the directory and the signaling relay as async JS
//! functions; Codio supplies the transfer protocol, verification and
//! caching. Bytes are only ever returned after they hash to the requested
//! identifier. [`CodioClient::upload`] publishes local bytes under their
//! derived identifier.

pub mod bridge;
pub mod intercept;

#[cfg(target_arch = "wasm32")]
pub mod network;

pub use intercept::{
    extract_cid, PublishFailure, ResolveFailure, ResolvedMeta, CID_HEADER, SOURCE_HEADER,
};

#[cfg(target_arch = "wasm32")]
pub use client::CodioClient;

#[cfg(target_arch = "wasm32")]
mod client {
    use std::rc::Rc;
    use std::sync::Arc;

    use codio_p2p::{ResolveOptions, Resolver, ResolverConfig, WebRtcConnector};
    use js_sys::{Array, Function, Promise, Reflect, Uint8Array};
    use wasm_bindgen::prelude::*;

    use crate::bridge::{JsDht, JsSignaling};
    use crate::intercept::{PublishFailure, ResolveFailure, ResolvedMeta};
    use crate::network::BrowserGateway;

    /// Install the panic hook and route `tracing` output to the console.
    #[wasm_bindgen(start)]
    pub fn init() {
        console_error_panic_hook::set_once();
        // A host that already installed a subscriber keeps it.
        let _ = tracing_wasm::try_set_as_global_default();
    }

    fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(value).map_err(|e| JsValue::from_str(&e.to_string()))
    }

    /// The JS-facing client. One per service worker.
    #[wasm_bindgen]
    pub struct CodioClient {
        resolver: Rc<Resolver>,
    }

    #[wasm_bindgen]
    impl CodioClient {
        /// Build a client.
        ///
        /// `config_json` is a camelCase `ResolverConfig`; an empty string
        /// selects the defaults. `find_providers` and `signal` are the
        /// directory and signaling functions described in [`crate::bridge`].
        /// `ice_servers` is an array of STUN/TURN URLs.
        #[wasm_bindgen(constructor)]
        pub fn new(
            config_json: &str,
            find_providers: Function,
            signal: Function,
            ice_servers: Array,
        ) -> Result<CodioClient, JsValue> {
            let config = if config_json.trim().is_empty() {
                ResolverConfig::default()
            } else {
                ResolverConfig::from_json(config_json)
                    .map_err(|e| JsValue::from_str(&format!("Invalid config: {}", e)))?
            };
            let ice_servers = ice_servers.iter().filter_map(|v| v.as_string()).collect();

            let resolver = Resolver::new(
                config,
                Arc::new(JsDht::new(find_providers)),
                Arc::new(WebRtcConnector::new(ice_servers)),
                Arc::new(JsSignaling::new(signal)),
                Arc::new(BrowserGateway),
            )
            .map_err(|e| JsValue::from_str(&format!("Invalid config: {}", e)))?;

            Ok(CodioClient {
                resolver: Rc::new(resolver),
            })
        }

        /// Resolve `cid` to verified bytes.
        ///
        /// Resolves to `{bytes, cid, source, servedBy, fromCache, size}`.
        /// Rejects with `{code, cid, message, attempted}`. `options` may be
        /// `undefined` or `{deadlineMs, fallback}`.
        pub fn resolve(&self, cid: String, options: JsValue) -> Promise {
            let resolver = Rc::clone(&self.resolver);
            wasm_bindgen_futures::future_to_promise(async move {
                let options: ResolveOptions = if options.is_undefined() || options.is_null() {
                    ResolveOptions::default()
                } else {
                    serde_wasm_bindgen::from_value(options)
                        .map_err(|e| JsValue::from_str(&format!("Invalid options: {}", e)))?
                };

                match resolver.resolve(&cid, options).await {
                    Ok(resolution) => {
                        let result = to_js(&ResolvedMeta::from_resolution(&resolution))?;
                        let bytes = Uint8Array::from(resolution.bytes());
                        Reflect::set(&result, &JsValue::from_str("bytes"), &bytes)?;
                        Ok(result)
                    }
                    Err(err) => Err(to_js(&ResolveFailure::from(&err))?),
                }
            })
        }

        /// Publish `bytes` from this client.
        ///
        /// Resolves to the derived identifier; later `resolve` calls for it
        /// are served from the cache with source `local`. Rejects with
        /// `{code, message}`.
        pub fn upload(&self, bytes: Vec<u8>) -> Promise {
            let resolver = Rc::clone(&self.resolver);
            wasm_bindgen_futures::future_to_promise(async move {
                match resolver.publish(bytes).await {
                    Ok(cid) => Ok(JsValue::from_str(cid.as_str())),
                    Err(err) => Err(to_js(&PublishFailure::from(&err))?),
                }
            })
        }

        /// Identifier this client would serve for a request, or `undefined`
        /// if the request should go to the network untouched.
        #[wasm_bindgen(js_name = extractCid)]
        pub fn extract_cid(url: &str, header: Option<String>) -> Option<String> {
            crate::intercept::extract_cid(url, header.as_deref()).map(|cid| cid.to_string())
        }

        #[wasm_bindgen(js_name = sourceHeader)]
        pub fn source_header() -> String {
            crate::intercept::SOURCE_HEADER.to_string()
        }

        #[wasm_bindgen(js_name = cacheStats)]
        pub fn cache_stats(&self) -> Result<JsValue, JsValue> {
            to_js(&self.resolver.cache_stats())
        }

        /// Cancel in-flight fetches and refuse new ones.
        pub fn shutdown(&self) {
            self.resolver.shutdown();
        }
    }
}
