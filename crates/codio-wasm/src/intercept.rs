//! Request-interception helpers.
//!
//! The service worker decides per request whether Codio should serve it,
//! then turns a [`Resolution`] or [`ResolveError`] into the objects handed
//! back to JavaScript. Nothing here touches browser APIs, so it is tested
//! natively.

use codio_core::ContentId;
use codio_p2p::{AttemptedSource, PublishError, Resolution, ResolveError};
use serde::Serialize;

/// Request header naming the identifier to resolve.
pub const CID_HEADER: &str = "X-Codio-CID";

/// Response header recording where the bytes came from (`p2p`, `gateway`
/// or `local`).
pub const SOURCE_HEADER: &str = "X-Codio-Source";

const SCHEME_PREFIX: &str = "codio://";
const IPFS_PATH: &str = "/ipfs/";

/// Pull a content identifier out of an intercepted request.
///
/// An explicit `X-Codio-CID` header wins. Otherwise `codio://<cid>` and
/// `.../ipfs/<cid>` URLs are recognised. Only identifiers that parse are
/// returned, so everything else passes through to the network untouched.
pub fn extract_cid(url: &str, header: Option<&str>) -> Option<ContentId> {
    if let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) {
        return ContentId::parse(value).ok();
    }

    let candidate = if let Some(rest) = url.strip_prefix(SCHEME_PREFIX) {
        rest
    } else {
        let at = url.find(IPFS_PATH)?;
        &url[at + IPFS_PATH.len()..]
    };
    let end = candidate
        .find(|c| matches!(c, '/' | '?' | '#'))
        .unwrap_or(candidate.len());
    ContentId::parse(&candidate[..end]).ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMeta {
    pub cid: String,
    pub source: &'static str,
    /// Peer id or gateway endpoint that served the bytes, `local` for
    /// content published here.
    pub served_by: String,
    pub from_cache: bool,
    pub size: usize,
}

impl ResolvedMeta {
    pub fn from_resolution(resolution: &Resolution) -> Self {
        let served_by = match &resolution.source {
            codio_core::ContentSource::P2p { peer } => peer.clone(),
            codio_core::ContentSource::Gateway { endpoint } => endpoint.clone(),
            codio_core::ContentSource::Local => "local".to_string(),
        };
        Self {
            cid: resolution.cid().to_string(),
            source: resolution.source.label(),
            served_by,
            from_cache: resolution.from_cache,
            size: resolution.bytes().len(),
        }
    }
}

/// Rejection value for a failed `resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveFailure {
    pub code: &'static str,
    pub cid: Option<String>,
    pub message: String,
    pub attempted: Vec<AttemptedSource>,
}

impl From<&ResolveError> for ResolveFailure {
    fn from(err: &ResolveError) -> Self {
        let cid = match err {
            ResolveError::InvalidIdentifier { input, .. } => Some(input.clone()),
            other => other.cid().map(|cid| cid.to_string()),
        };
        Self {
            code: err.code(),
            cid,
            message: err.to_string(),
            attempted: err.attempted().to_vec(),
        }
    }
}

/// Rejection value for a failed `upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishFailure {
    pub code: &'static str,
    pub message: String,
}

impl From<&PublishError> for PublishFailure {
    fn from(err: &PublishError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
