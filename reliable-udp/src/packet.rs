//! Wire format for Go-Back-N and Selective-Repeat frames.
//!
//! Every datagram exchanged by the windowed ARQ engines is a [`Frame`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (type, sequence number, digest).
//! - Serialising a [`Frame`] into a byte buffer ready for transmission.
//! - Parsing raw bytes back into a [`Frame`] together with an integrity
//!   verdict.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |               Sequence Number ...             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Seq      |                 Digest ...                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Digest   |                 Payload ...                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 9 bytes.
//! type(1) + seq(4) + digest(4)
//!
//! # Integrity
//!
//! The digest is the first four bytes of SHA-256 over `type ‖ seq ‖ payload`.
//! A mismatch is **not** an error: [`Frame::decode`] still returns the parsed
//! frame with [`Decoded::intact`] set to `false`, and the caller decides
//! whether to drop it or answer with a duplicate ACK.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 9;

/// Byte length of the truncated integrity digest.
pub const DIGEST_LEN: usize = 4;

// Byte offsets of each field within the serialised header.
const OFF_TYPE: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_DIGEST: usize = 5;

/// Compute the truncated integrity digest over the concatenation of `parts`.
///
/// Shared by the ARQ frame codec and the connection segment codec.
pub fn digest(parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let full = hasher.finalize();
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&full[..DIGEST_LEN]);
    out
}

/// Frame type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Ack,
    /// Any other value (e.g. a type byte flipped in transit).
    Unknown(u8),
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => FrameKind::Data,
            1 => FrameKind::Ack,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Ack => 1,
            FrameKind::Unknown(v) => v,
        }
    }
}

/// A GBN/SR datagram: type, sequence number and payload.
///
/// For [`FrameKind::Ack`] the sequence number is the acknowledged sequence
/// (cumulative for GBN, selective for SR) and the payload is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Result of parsing a datagram that was long enough to hold a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub frame: Frame,
    /// `true` when the recomputed digest matched the one on the wire.
    pub intact: bool,
}

/// Structural decode failure.  Corruption is reported via [`Decoded::intact`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

impl Frame {
    /// Build a DATA frame.
    pub fn data(seq: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Data,
            seq,
            payload,
        }
    }

    /// Build an ACK frame for `seq`.
    pub fn ack(seq: u32) -> Self {
        Self {
            kind: FrameKind::Ack,
            seq,
            payload: Vec::new(),
        }
    }

    fn compute_digest(kind: u8, seq: u32, payload: &[u8]) -> [u8; DIGEST_LEN] {
        digest(&[&[kind], &seq.to_be_bytes(), payload])
    }

    /// Serialise this frame into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind.to_u8();
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_TYPE] = kind;
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_DIGEST..OFF_DIGEST + DIGEST_LEN]
            .copy_from_slice(&Self::compute_digest(kind, self.seq, &self.payload));
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        buf
    }

    /// Parse a frame from a raw datagram.
    ///
    /// Returns [`DecodeError::TooShort`] only when `buf` cannot hold a header.
    /// Every other input yields a frame; a digest mismatch is reported through
    /// [`Decoded::intact`].
    pub fn decode(buf: &[u8]) -> Result<Decoded, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let kind = buf[OFF_TYPE];
        let seq = u32::from_be_bytes([
            buf[OFF_SEQ],
            buf[OFF_SEQ + 1],
            buf[OFF_SEQ + 2],
            buf[OFF_SEQ + 3],
        ]);
        let payload = buf[HEADER_LEN..].to_vec();

        let intact =
            buf[OFF_DIGEST..OFF_DIGEST + DIGEST_LEN] == Self::compute_digest(kind, seq, &payload);

        Ok(Decoded {
            frame: Frame {
                kind: FrameKind::from_u8(kind),
                seq,
                payload,
            },
            intact,
        })
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.kind {
            FrameKind::Data => "DATA".to_string(),
            FrameKind::Ack => "ACK".to_string(),
            FrameKind::Unknown(v) => format!("UNKNOWN(0x{v:02x})"),
        };
        write!(f, "[{name}] seq={} len={}", self.seq, self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_data_frame() {
        let frame = Frame::data(7, b"hello".to_vec());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert!(decoded.intact);
        assert_eq!(decoded.frame, frame);
    }

    #[test]
    fn ack_has_empty_payload() {
        let bytes = Frame::ack(42).encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.frame.kind, FrameKind::Ack);
        assert_eq!(decoded.frame.seq, 42);
    }

    #[test]
    fn decode_short_buffer_is_structural_failure() {
        assert_eq!(
            Frame::decode(&[0u8; HEADER_LEN - 1]),
            Err(DecodeError::TooShort {
                expected: HEADER_LEN,
                actual: HEADER_LEN - 1
            })
        );
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn flipped_payload_byte_is_reported_not_raised() {
        let mut bytes = Frame::data(3, b"payload".to_vec()).encode();
        bytes[HEADER_LEN + 2] ^= 0xff;
        let decoded = Frame::decode(&bytes).unwrap();
        assert!(!decoded.intact);
        assert_eq!(decoded.frame.seq, 3);
    }

    #[test]
    fn flipped_type_byte_yields_unknown_kind() {
        let mut bytes = Frame::data(1, b"x".to_vec()).encode();
        bytes[OFF_TYPE] ^= 0xff;
        let decoded = Frame::decode(&bytes).unwrap();
        assert!(!decoded.intact);
        assert_eq!(decoded.frame.kind, FrameKind::Unknown(0xff));
    }

    #[test]
    fn digest_covers_sequence_number() {
        let mut bytes = Frame::ack(5).encode();
        bytes[OFF_SEQ + 3] ^= 0x01;
        assert!(!Frame::decode(&bytes).unwrap().intact);
    }

    #[test]
    fn seq_big_endian_on_wire() {
        let bytes = Frame::data(0x0102_0304, Vec::new()).encode();
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest(&[b"abc"]), digest(&[b"a", b"bc"]));
        assert_ne!(digest(&[b"abc"]), digest(&[b"abd"]));
    }
}
