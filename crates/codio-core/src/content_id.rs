//! Content identifier codec.
//!
//! A `ContentId` names an immutable byte object by its SHA2-256 digest.
//! Two self-describing string encodings are accepted:
//!
//! - **CIDv0**: base58btc of the multihash `0x12 0x20 || digest`.
//!   Always 46 characters, always starts with `Qm`. This is what
//!   [`derive`] produces.
//! - **CIDv1 (raw codec)**: multibase `b` (base32 lower) of
//!   `0x01 0x55 0x12 0x20 || digest`. Always 59 characters.
//!
//! [`parse`] rejects malformed input before any network activity so a bad
//! identifier never costs a DHT lookup.

use std::fmt;
use std::str::FromStr;

use cid::{Cid, Version};
use multihash::Multihash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// SHA2-256 multihash code.
pub const SHA2_256_CODE: u64 = 0x12;

/// Multicodec for raw binary content.
pub const RAW_CODEC: u64 = 0x55;

/// Length of a SHA2-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Encoded length of a CIDv0 string.
pub const CID_V0_LEN: usize = 46;

/// Encoded length of a CIDv1 raw/sha2-256 string in base32.
pub const CID_V1_LEN: usize = 59;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Errors produced while parsing an identifier string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidError {
    #[error("identifier is empty")]
    Empty,

    #[error("unknown identifier prefix {found:?} (expected \"Qm\" or \"b\")")]
    UnknownPrefix { found: String },

    #[error("wrong identifier length: expected {expected}, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("invalid character {ch:?} at position {position}")]
    InvalidCharacter { ch: char, position: usize },

    #[error("malformed identifier: {reason}")]
    Malformed { reason: String },

    #[error("unsupported hash algorithm 0x{code:x} (only sha2-256 is accepted)")]
    UnsupportedHash { code: u64 },

    #[error("unsupported codec 0x{codec:x} (only raw is accepted for CIDv1)")]
    UnsupportedCodec { codec: u64 },
}

/// Which of the two accepted encodings an identifier uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CidVersion {
    V0,
    V1,
}

/// Self-describing, hash-derived name for an immutable byte object.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentId {
    inner: Cid,
    encoded: String,
}

fn sha256_multihash(data: &[u8]) -> Multihash<64> {
    let digest = Sha256::digest(data);
    Multihash::wrap(SHA2_256_CODE, &digest).expect("SHA256 digest is always 32 bytes")
}

impl ContentId {
    /// Derive the CIDv0 identifier for `data`.
    pub fn derive(data: &[u8]) -> Self {
        let inner = Cid::new_v0(sha256_multihash(data)).expect("sha2-256 multihash is a valid CIDv0");
        Self::from_cid(inner)
    }

    /// Derive the CIDv1 (raw codec) identifier for `data`.
    pub fn derive_v1(data: &[u8]) -> Self {
        Self::from_cid(Cid::new_v1(RAW_CODEC, sha256_multihash(data)))
    }

    fn from_cid(inner: Cid) -> Self {
        let encoded = inner.to_string();
        Self { inner, encoded }
    }

    /// Parse and validate an identifier string.
    pub fn parse(s: &str) -> Result<Self, CidError> {
        let version = precheck(s)?;

        let inner = Cid::from_str(s).map_err(|e| CidError::Malformed {
            reason: e.to_string(),
        })?;

        let hash = inner.hash();
        if hash.code() != SHA2_256_CODE || hash.digest().len() != DIGEST_LEN {
            return Err(CidError::UnsupportedHash { code: hash.code() });
        }

        match (version, inner.version()) {
            (CidVersion::V0, Version::V0) => {}
            (CidVersion::V1, Version::V1) => {
                if inner.codec() != RAW_CODEC {
                    return Err(CidError::UnsupportedCodec {
                        codec: inner.codec(),
                    });
                }
            }
            _ => {
                return Err(CidError::Malformed {
                    reason: "prefix does not match encoded CID version".to_string(),
                })
            }
        }

        Ok(Self {
            inner,
            encoded: s.to_string(),
        })
    }

    /// Recompute the identifier of `data` and compare.
    ///
    /// Any byte difference is a rejection; content is never partially accepted.
    pub fn verify(&self, data: &[u8]) -> bool {
        let digest = Sha256::digest(data);
        self.digest() == digest.as_slice()
    }

    /// The encoded string form.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn version(&self) -> CidVersion {
        match self.inner.version() {
            Version::V0 => CidVersion::V0,
            Version::V1 => CidVersion::V1,
        }
    }

    /// The raw SHA2-256 digest.
    pub fn digest(&self) -> &[u8] {
        self.inner.hash().digest()
    }

    /// Multihash bytes (`0x12 0x20 || digest`).
    ///
    /// Identical for the CIDv0 and CIDv1 forms of the same content, which
    /// makes it the natural DHT key.
    pub fn multihash_bytes(&self) -> Vec<u8> {
        self.inner.hash().to_bytes()
    }
}

/// Cheap structural validation that runs before the full decode.
fn precheck(s: &str) -> Result<CidVersion, CidError> {
    if s.is_empty() {
        return Err(CidError::Empty);
    }

    let (version, expected_len) = if s.starts_with("Qm") {
        (CidVersion::V0, CID_V0_LEN)
    } else if s.starts_with('b') {
        (CidVersion::V1, CID_V1_LEN)
    } else {
        return Err(CidError::UnknownPrefix {
            found: s.chars().take(2).collect(),
        });
    };

    let actual = s.chars().count();
    if actual != expected_len {
        return Err(CidError::WrongLength {
            expected: expected_len,
            actual,
        });
    }

    for (position, ch) in s.chars().enumerate() {
        let valid = match version {
            CidVersion::V0 => BASE58_ALPHABET.contains(ch),
            CidVersion::V1 => ch.is_ascii_lowercase() || ('2'..='7').contains(&ch),
        };
        if !valid {
            return Err(CidError::InvalidCharacter { ch, position });
        }
    }

    Ok(version)
}

/// Derive the CIDv0 identifier for `data`.
pub fn derive(data: &[u8]) -> ContentId {
    ContentId::derive(data)
}

/// Check that `data` hashes to `cid`.
pub fn verify(data: &[u8], cid: &ContentId) -> bool {
    cid.verify(data)
}

/// Parse an identifier string.
pub fn parse(s: &str) -> Result<ContentId, CidError> {
    ContentId::parse(s)
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.encoded)
    }
}

impl FromStr for ContentId {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use proptest::prelude::*;

    #[test]
    fn test_derive_v0_shape() {
        let cid = derive(b"Hello, decentralized world!");
        assert!(cid.as_str().starts_with("Qm"));
        assert_eq!(cid.as_str().len(), CID_V0_LEN);
        assert_eq!(cid.version(), CidVersion::V0);
    }

    #[test]
    fn test_derive_v1_shape() {
        let cid = ContentId::derive_v1(b"Hello, decentralized world!");
        assert!(cid.as_str().starts_with('b'));
        assert_eq!(cid.as_str().len(), CID_V1_LEN);
        assert_eq!(cid.version(), CidVersion::V1);
    }

    #[test]
    fn test_digest_is_sha256() {
        let cid = derive(b"hello world");
        assert_eq!(
            cid.digest(),
            hex!("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
    }

    #[test]
    fn test_same_content_same_cid() {
        assert_eq!(derive(b"Same content"), derive(b"Same content"));
    }

    #[test]
    fn test_different_content_different_cid() {
        assert_ne!(derive(b"hello"), derive(b"world"));
        assert_ne!(derive(b""), derive(&[0u8]));
    }

    #[test]
    fn test_verify() {
        let cid = derive(b"Test content");
        assert!(verify(b"Test content", &cid));
        assert!(!verify(b"Test content!", &cid));
        assert!(!verify(b"", &cid));
    }

    #[test]
    fn test_v0_and_v1_share_multihash() {
        let v0 = derive(b"shared");
        let v1 = ContentId::derive_v1(b"shared");
        assert_ne!(v0, v1);
        assert_eq!(v0.multihash_bytes(), v1.multihash_bytes());
        assert!(v1.verify(b"shared"));
    }

    #[test]
    fn test_parse_roundtrip_both_versions() {
        let v0 = derive(b"roundtrip");
        assert_eq!(parse(v0.as_str()).unwrap(), v0);

        let v1 = ContentId::derive_v1(b"roundtrip");
        assert_eq!(parse(v1.as_str()).unwrap(), v1);
    }

    #[test]
    fn test_parse_rejects_invalid_cid() {
        assert!(matches!(
            parse("invalid-cid"),
            Err(CidError::UnknownPrefix { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(parse(""), Err(CidError::Empty));
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let cid = derive(b"length");
        let truncated = &cid.as_str()[..CID_V0_LEN - 1];
        assert!(matches!(
            parse(truncated),
            Err(CidError::WrongLength { expected: CID_V0_LEN, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_alphabet_characters() {
        let cid = derive(b"alphabet");
        // '0' is excluded from base58.
        let mut tampered: Vec<char> = cid.as_str().chars().collect();
        tampered[10] = '0';
        let tampered: String = tampered.into_iter().collect();
        assert_eq!(
            parse(&tampered),
            Err(CidError::InvalidCharacter { ch: '0', position: 10 })
        );

        let mut dashed: Vec<char> = cid.as_str().chars().collect();
        dashed[20] = '-';
        let dashed: String = dashed.into_iter().collect();
        assert!(matches!(
            parse(&dashed),
            Err(CidError::InvalidCharacter { ch: '-', .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_raw_v1() {
        // CIDv1 with dag-pb codec (0x70) over a sha2-256 digest.
        let hash = sha256_multihash(b"dag-pb");
        let dag_pb = Cid::new_v1(0x70, hash).to_string();
        assert_eq!(
            parse(&dag_pb),
            Err(CidError::UnsupportedCodec { codec: 0x70 })
        );
    }

    #[test]
    fn test_serde_uses_string_form() {
        let cid = derive(b"serde");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", cid));
        let back: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
        assert!(serde_json::from_str::<ContentId>("\"invalid-cid\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_derived_content_verifies(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let cid = derive(&data);
            prop_assert!(verify(&data, &cid));
            prop_assert_eq!(parse(cid.as_str()).unwrap(), cid);
        }

        #[test]
        fn prop_distinct_content_distinct_cid(
            a in proptest::collection::vec(any::<u8>(), 0..256),
            b in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(derive(&a), derive(&b));
        }
    }
}
