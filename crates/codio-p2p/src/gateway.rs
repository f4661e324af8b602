//! HTTP gateway access.
//!
//! A gateway serves content-addressed objects at `{endpoint}/{cid}`. It is
//! trusted for availability only: whatever it returns is verified by the
//! resolver exactly like peer content.

use async_trait::async_trait;
use thiserror::Error;

use crate::{MaybeSend, MaybeSync};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway returned HTTP {status}")]
    Status { status: u16 },

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway request failed: {0}")]
    Transport(String),

    #[error("gateway response exceeds {limit} byte limit")]
    TooLarge { limit: usize },
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Status { .. } => "http_status",
            GatewayError::Timeout => "timeout",
            GatewayError::Transport(_) => "transport",
            GatewayError::TooLarge { .. } => "too_large",
        }
    }
}

/// Performs a single GET and returns the body.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait Gateway: MaybeSend + MaybeSync {
    async fn get(&self, url: &str) -> Result<Vec<u8>, GatewayError>;
}

/// URL of `cid` on `endpoint`.
pub fn gateway_url(endpoint: &str, cid: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), cid)
}

/// Native gateway client.
#[cfg(not(target_arch = "wasm32"))]
pub struct HttpGateway {
    client: reqwest::Client,
}

#[cfg(not(target_arch = "wasm32"))]
impl HttpGateway {
    pub fn new(timeout: std::time::Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl Gateway for HttpGateway {
    async fn get(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(body.to_vec())
    }
}
