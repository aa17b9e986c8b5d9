//! Wire format for connection segments.
//!
//! A [`Segment`] is the unit exchanged by [`crate::connection::Connection`]
//! and [`crate::listener::Listener`].  Its header mirrors a trimmed-down TCP
//! header; the integrity digest comes from [`crate::packet::digest`].
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Acknowledgment Number                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |            Window             |  Reserved ... |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | ... Reserved  |                 Digest ...                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Digest   |                 Payload ...                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 21 bytes.
//! The digest covers the first 17 header bytes followed by the payload.

use crate::packet::{digest, DecodeError, DIGEST_LEN};

/// Bit-flags carried in the `flags` byte.
pub mod flags {
    /// Sender has finished sending data.
    pub const FIN: u8 = 0x01;
    /// Synchronise sequence numbers (connection setup).
    pub const SYN: u8 = 0x02;
    /// The acknowledgment number field is significant.
    pub const ACK: u8 = 0x10;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 21;

const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_WINDOW: usize = 13;
const OFF_DIGEST: usize = 17;

/// One connection-layer segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Segment {
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number of the first payload byte (or of the SYN/FIN itself).
    pub seq: u32,
    /// Next sequence number expected from the peer; valid when ACK is set.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Sender's advertised receive-buffer capacity in bytes.
    pub window: u16,
    pub payload: Vec<u8>,
}

/// Result of parsing a datagram long enough to hold a segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSegment {
    pub segment: Segment,
    pub intact: bool,
}

impl Segment {
    /// `true` when every bit in `mask` is set.
    #[inline]
    pub fn has(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }

    /// Sequence space consumed by this segment: payload bytes plus one for
    /// each of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.has(flags::SYN) {
            len += 1;
        }
        if self.has(flags::FIN) {
            len += 1;
        }
        len
    }

    fn header_prefix(&self) -> [u8; OFF_DIGEST] {
        let mut h = [0u8; OFF_DIGEST];
        h[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.src_port.to_be_bytes());
        h[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.dst_port.to_be_bytes());
        h[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        h[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        h[OFF_FLAGS] = self.flags;
        h[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        // Bytes 15..17 are reserved and stay zero.
        h
    }

    /// Serialise this segment into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let prefix = self.header_prefix();
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&prefix);
        buf.extend_from_slice(&digest(&[&prefix, &self.payload]));
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a segment from a raw datagram.
    ///
    /// Fails only when `buf` is shorter than [`HEADER_LEN`]; a digest mismatch
    /// is reported through [`DecodedSegment::intact`].
    pub fn decode(buf: &[u8]) -> Result<DecodedSegment, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let u16_at = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);
        let u32_at =
            |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        let payload = buf[HEADER_LEN..].to_vec();
        let intact = buf[OFF_DIGEST..OFF_DIGEST + DIGEST_LEN]
            == digest(&[&buf[..OFF_DIGEST], &payload]);

        Ok(DecodedSegment {
            segment: Segment {
                src_port: u16_at(OFF_SRC_PORT),
                dst_port: u16_at(OFF_DST_PORT),
                seq: u32_at(OFF_SEQ),
                ack: u32_at(OFF_ACK),
                flags: buf[OFF_FLAGS],
                window: u16_at(OFF_WINDOW),
                payload,
            },
            intact,
        })
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.has(flags::SYN) {
            names.push("SYN");
        }
        if self.has(flags::FIN) {
            names.push("FIN");
        }
        if self.has(flags::ACK) {
            names.push("ACK");
        }
        write!(
            f,
            "[{}] seq={} ack={} win={} len={}",
            names.join("|"),
            self.seq,
            self.ack,
            self.window,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Segment {
        Segment {
            src_port: 4000,
            dst_port: 5000,
            seq: 123,
            ack: 456,
            flags: flags::ACK,
            window: 4096,
            payload: b"data".to_vec(),
        }
    }

    #[test]
    fn header_is_21_bytes() {
        let s = Segment::default();
        assert_eq!(s.encode().len(), HEADER_LEN);
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let s = sample();
        let d = Segment::decode(&s.encode()).unwrap();
        assert!(d.intact);
        assert_eq!(d.segment, s);
    }

    #[test]
    fn flag_bits_match_wire_positions() {
        assert_eq!(flags::FIN, 1 << 0);
        assert_eq!(flags::SYN, 1 << 1);
        assert_eq!(flags::ACK, 1 << 4);

        let s = Segment {
            flags: flags::SYN | flags::ACK,
            ..Segment::default()
        };
        assert_eq!(s.encode()[OFF_FLAGS], 0x12);
        assert!(s.has(flags::SYN | flags::ACK));
        assert!(!s.has(flags::FIN));
    }

    #[test]
    fn corrupted_header_or_payload_is_flagged() {
        let bytes = sample().encode();
        for pos in [OFF_SEQ, OFF_WINDOW, HEADER_LEN + 1] {
            let mut b = bytes.clone();
            b[pos] ^= 0xff;
            assert!(!Segment::decode(&b).unwrap().intact, "byte {pos}");
        }
    }

    #[test]
    fn short_input_is_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            Segment::decode(&bytes[..HEADER_LEN - 1]),
            Err(DecodeError::TooShort { actual: 20, .. })
        ));
    }

    #[test]
    fn seq_len_counts_syn_and_fin() {
        let mut s = Segment::default();
        assert_eq!(s.seq_len(), 0);
        s.flags = flags::SYN;
        assert_eq!(s.seq_len(), 1);
        s.flags = flags::FIN | flags::ACK;
        s.payload = vec![0; 10];
        assert_eq!(s.seq_len(), 11);
    }
}
