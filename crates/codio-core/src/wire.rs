//! Frame codec for content transfer over a peer data channel.
//!
//! Each data-channel message carries exactly one frame:
//!
//! ```text
//! +-----+----------------------+
//! | tag | payload              |
//! +-----+----------------------+
//!   1B    0..MAX_FRAME_SIZE-1
//! ```
//!
//! | tag  | frame      | payload                          |
//! |------|------------|----------------------------------|
//! | 0x01 | Request    | identifier string (UTF-8)        |
//! | 0x02 | Chunk      | raw content bytes                |
//! | 0x03 | Complete   | total content length, u64 BE     |
//! | 0x04 | NotFound   | identifier string (UTF-8)        |
//! | 0x05 | Cancel     | empty                            |
//!
//! Chunks carry no integrity data of their own. Identifiers address whole
//! objects, so only the reassembled content is verified.

use thiserror::Error;

use crate::content_id::{CidError, ContentId};

/// Largest frame accepted from a peer (tag byte included).
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Chunk size used when serving content. Kept well under common data
/// channel message limits.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

const TAG_REQUEST: u8 = 0x01;
const TAG_CHUNK: u8 = 0x02;
const TAG_COMPLETE: u8 = 0x03;
const TAG_NOT_FOUND: u8 = 0x04;
const TAG_CANCEL: u8 = 0x05;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("truncated {frame} frame")]
    Truncated { frame: &'static str },

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("identifier is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid identifier in frame: {0}")]
    InvalidCid(#[from] CidError),
}

/// One message on a transfer channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferMessage {
    /// Ask the peer for the object named by the identifier.
    Request { cid: ContentId },
    /// A slice of the object, in order.
    Chunk { data: Vec<u8> },
    /// The peer has sent every chunk.
    Complete { total_len: u64 },
    /// The peer does not hold the object.
    NotFound { cid: ContentId },
    /// The requester is abandoning the transfer.
    Cancel,
}

impl TransferMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            TransferMessage::Request { cid } => tagged(TAG_REQUEST, cid.as_str().as_bytes()),
            TransferMessage::Chunk { data } => tagged(TAG_CHUNK, data),
            TransferMessage::Complete { total_len } => {
                tagged(TAG_COMPLETE, &total_len.to_be_bytes())
            }
            TransferMessage::NotFound { cid } => tagged(TAG_NOT_FOUND, cid.as_str().as_bytes()),
            TransferMessage::Cancel => vec![TAG_CANCEL],
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let (&tag, payload) = frame.split_first().ok_or(WireError::Empty)?;

        match tag {
            TAG_REQUEST => Ok(TransferMessage::Request {
                cid: decode_cid(payload)?,
            }),
            TAG_CHUNK => Ok(TransferMessage::Chunk {
                data: payload.to_vec(),
            }),
            TAG_COMPLETE => {
                let bytes: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| WireError::Truncated { frame: "complete" })?;
                Ok(TransferMessage::Complete {
                    total_len: u64::from_be_bytes(bytes),
                })
            }
            TAG_NOT_FOUND => Ok(TransferMessage::NotFound {
                cid: decode_cid(payload)?,
            }),
            TAG_CANCEL => Ok(TransferMessage::Cancel),
            other => Err(WireError::UnknownTag(other)),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferMessage::Request { .. } => "request",
            TransferMessage::Chunk { .. } => "chunk",
            TransferMessage::Complete { .. } => "complete",
            TransferMessage::NotFound { .. } => "not_found",
            TransferMessage::Cancel => "cancel",
        }
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(tag);
    frame.extend_from_slice(payload);
    frame
}

fn decode_cid(payload: &[u8]) -> Result<ContentId, WireError> {
    let s = std::str::from_utf8(payload).map_err(|_| WireError::InvalidUtf8)?;
    Ok(ContentId::parse(s)?)
}

/// Split `data` into the frame sequence a serving peer sends: chunks
/// followed by `Complete`.
pub fn content_frames(data: &[u8], chunk_size: usize) -> Vec<TransferMessage> {
    let chunk_size = chunk_size.clamp(1, MAX_FRAME_SIZE - 1);
    let mut frames: Vec<TransferMessage> = data
        .chunks(chunk_size)
        .map(|chunk| TransferMessage::Chunk {
            data: chunk.to_vec(),
        })
        .collect();
    frames.push(TransferMessage::Complete {
        total_len: data.len() as u64,
    });
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_layout() {
        let cid = ContentId::derive(b"frame");
        let frame = TransferMessage::Request { cid: cid.clone() }.encode();
        assert_eq!(frame[0], TAG_REQUEST);
        assert_eq!(&frame[1..], cid.as_str().as_bytes());
        assert_eq!(
            TransferMessage::decode(&frame).unwrap(),
            TransferMessage::Request { cid }
        );
    }

    #[test]
    fn test_complete_frame_is_big_endian() {
        let frame = TransferMessage::Complete { total_len: 258 }.encode();
        assert_eq!(frame, vec![TAG_COMPLETE, 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_decode_rejects_empty_and_unknown() {
        assert_eq!(TransferMessage::decode(&[]), Err(WireError::Empty));
        assert_eq!(
            TransferMessage::decode(&[0x7f, 1, 2]),
            Err(WireError::UnknownTag(0x7f))
        );
    }

    #[test]
    fn test_decode_rejects_truncated_complete() {
        assert_eq!(
            TransferMessage::decode(&[TAG_COMPLETE, 0, 1]),
            Err(WireError::Truncated { frame: "complete" })
        );
    }

    #[test]
    fn test_decode_rejects_oversize_frame() {
        let mut frame = vec![TAG_CHUNK];
        frame.resize(MAX_FRAME_SIZE + 1, 0);
        assert!(matches!(
            TransferMessage::decode(&frame),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_identifier() {
        let mut frame = vec![TAG_REQUEST];
        frame.extend_from_slice(b"invalid-cid");
        assert!(matches!(
            TransferMessage::decode(&frame),
            Err(WireError::InvalidCid(CidError::UnknownPrefix { .. }))
        ));
    }

    #[test]
    fn test_content_frames_reassemble() {
        let data: Vec<u8> = (0..100u8).collect();
        let frames = content_frames(&data, 30);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4], TransferMessage::Complete { total_len: 100 });

        let reassembled: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                TransferMessage::Chunk { data } => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_content_frames_empty_content() {
        let frames = content_frames(&[], DEFAULT_CHUNK_SIZE);
        assert_eq!(frames, vec![TransferMessage::Complete { total_len: 0 }]);
    }
}
