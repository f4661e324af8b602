//! Browser gateway client.
//!
//! Gateway requests go through the Fetch API of whichever global scope the
//! client runs in: a page (`Window`) or a service worker
//! (`WorkerGlobalScope`). Responses are untrusted; the resolver re-hashes
//! every body before using it.

use async_trait::async_trait;
use codio_p2p::{Gateway, GatewayError};
use js_sys::Promise;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{Request, RequestInit, RequestMode, Response, Window, WorkerGlobalScope};

#[wasm_bindgen]
extern "C" {
    type Global;

    #[wasm_bindgen(method, getter, js_name = Window)]
    fn window(this: &Global) -> JsValue;

    #[wasm_bindgen(method, getter, js_name = WorkerGlobalScope)]
    fn worker(this: &Global) -> JsValue;
}

/// `fetch` on the current global scope.
fn global_fetch(request: &Request) -> Result<Promise, GatewayError> {
    let global: Global = js_sys::global().unchecked_into();
    if !global.window().is_undefined() {
        let window: Window = global.unchecked_into();
        Ok(window.fetch_with_request(request))
    } else if !global.worker().is_undefined() {
        let worker: WorkerGlobalScope = global.unchecked_into();
        Ok(worker.fetch_with_request(request))
    } else {
        Err(GatewayError::Transport("no fetch in this global scope".to_string()))
    }
}

/// Fetch a URL and return the body bytes. Non-2xx is an error.
pub async fn fetch_bytes(url: &str) -> Result<Vec<u8>, GatewayError> {
    let opts = RequestInit::new();
    opts.set_method("GET");
    opts.set_mode(RequestMode::Cors);

    let request = Request::new_with_str_and_init(url, &opts)
        .map_err(|e| GatewayError::Transport(format!("{:?}", e)))?;

    let resp_value = JsFuture::from(global_fetch(&request)?)
        .await
        .map_err(|e| GatewayError::Transport(format!("{:?}", e)))?;

    let resp: Response = resp_value
        .dyn_into()
        .map_err(|_| GatewayError::Transport("response is not a Response object".to_string()))?;

    if !resp.ok() {
        return Err(GatewayError::Status {
            status: resp.status(),
        });
    }

    let array_buffer = JsFuture::from(
        resp.array_buffer()
            .map_err(|e| GatewayError::Transport(format!("{:?}", e)))?,
    )
    .await
    .map_err(|e| GatewayError::Transport(format!("{:?}", e)))?;

    Ok(js_sys::Uint8Array::new(&array_buffer).to_vec())
}

/// [`Gateway`] backed by the browser Fetch API. Timeouts are applied by
/// the resolver around each call.
#[derive(Default)]
pub struct BrowserGateway;

#[async_trait(?Send)]
impl Gateway for BrowserGateway {
    async fn get(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        fetch_bytes(url).await
    }
}
