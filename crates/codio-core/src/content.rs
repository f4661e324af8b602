//! Verified content: the only byte payload the rest of Codio trusts.
//!
//! A [`VerifiedContent`] can only be built by [`verify_content`], which
//! re-derives the identifier from the bytes, or by [`seal_content`], which
//! derives it in the first place. Anything that holds one
//! (the cache, the resolver's caller) is therefore holding bytes that
//! provably match their identifier.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content_id::ContentId;

/// Content failed verification against the identifier it was requested by.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("content does not match {expected} ({received_len} bytes received)")]
pub struct IntegrityError {
    pub expected: ContentId,
    pub received_len: usize,
}

/// Bytes whose identifier has been re-derived and matched.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifiedContent {
    cid: ContentId,
    data: Arc<[u8]>,
}

impl VerifiedContent {
    pub fn cid(&self) -> &ContentId {
        &self.cid
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl fmt::Debug for VerifiedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedContent")
            .field("cid", &self.cid)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Verify `data` against `cid`, taking ownership of the bytes on success.
pub fn verify_content(
    cid: &ContentId,
    data: impl Into<Arc<[u8]>>,
) -> Result<VerifiedContent, IntegrityError> {
    let data = data.into();
    if cid.verify(&data) {
        Ok(VerifiedContent {
            cid: cid.clone(),
            data,
        })
    } else {
        Err(IntegrityError {
            expected: cid.clone(),
            received_len: data.len(),
        })
    }
}

/// Derive the CIDv0 identifier for `data` and wrap the bytes under it.
pub fn seal_content(data: impl Into<Arc<[u8]>>) -> VerifiedContent {
    let data = data.into();
    VerifiedContent {
        cid: ContentId::derive(&data),
        data,
    }
}

/// Where a piece of content was obtained from.
///
/// Surfaces to the interception boundary as the `p2p`, `gateway` or `local`
/// annotation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContentSource {
    /// Delivered by a peer over a direct transport session.
    P2p { peer: String },
    /// Delivered by an HTTP gateway.
    Gateway { endpoint: String },
    /// Published by this node.
    Local,
}

impl ContentSource {
    /// The short annotation handed to the interception boundary.
    pub fn label(&self) -> &'static str {
        match self {
            ContentSource::P2p { .. } => "p2p",
            ContentSource::Gateway { .. } => "gateway",
            ContentSource::Local => "local",
        }
    }

    pub fn is_p2p(&self) -> bool {
        matches!(self, ContentSource::P2p { .. })
    }
}

impl fmt::Display for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::P2p { peer } => write!(f, "p2p:{}", peer),
            ContentSource::Gateway { endpoint } => write!(f, "gateway:{}", endpoint),
            ContentSource::Local => f.write_str("local"),
        }
    }
}
