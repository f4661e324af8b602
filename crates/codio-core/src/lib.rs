//! # Codio Core
//!
//! Pure Rust content addressing for the Codio hybrid CDN client.
//!
//! This crate contains **no networking code** and **no WASM dependencies**.
//! Every byte obtained from a peer or a gateway passes through
//! [`verify_content`] before anything else is allowed to see it.
//!
//! ## Trust Model
//!
//! - **Identifiers** (`content_id` module): a CID is the SHA2-256 digest of
//!   the whole object plus a self-describing prefix. If the bytes hash to
//!   the identifier, they are the right bytes, whoever sent them.
//!
//! - **Verified content** (`content` module): `VerifiedContent` can only be
//!   built by re-deriving the identifier, so holding one is proof of
//!   integrity.
//!
//! - **Cache** (`cache` module): stores `VerifiedContent` only. Nothing
//!   unverified is ever cached.
//!
//! ## Usage
//!
//! ```ignore
//! use codio_core::{derive, verify_content, ContentCache};
//! ```

pub mod cache;
pub mod content;
pub mod content_id;
pub mod wire;

// Re-export commonly used types for convenience
pub use cache::{CacheStats, CachedContent, ContentCache, PutOutcome};
pub use content::{seal_content, verify_content, ContentSource, IntegrityError, VerifiedContent};
pub use content_id::{derive, parse, verify, CidError, CidVersion, ContentId};
pub use wire::{content_frames, TransferMessage, WireError, DEFAULT_CHUNK_SIZE, MAX_FRAME_SIZE};
