//! Framed binary protocol to the peripheral microcontroller.
//!
//! Layout (all multi-byte fields little-endian):
//! ```text
//! Offset  Size  Field
//! 0       1     header (0xAA)
//! 1       1     length (total frame size, <= 255)
//! 2       1     command
//! 3       2     sequence (little-endian)
//! 5       n     data (0..=248 bytes)
//! 5+n     1     xor (running XOR of every preceding byte)
//! 6+n     1     tail (0x55)
//! ```
//! Minimum frame size is 7 bytes (empty payload). Grounded on the
//! byte-offset doc table + compile-time size assertion idiom in
//! `edge/wire.rs`'s `EdgeTick`, adapted here to a variable-length frame.

pub const HEADER: u8 = 0xAA;
pub const TAIL: u8 = 0x55;
pub const MIN_FRAME_LEN: usize = 7;
pub const MAX_FRAME_LEN: usize = 255;
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - MIN_FRAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub sequence: u16,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, sequence: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            sequence,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload too large to fit the 1-byte length field.
    PayloadTooLarge { len: usize },
    /// Structural failure: bad header, bad tail, truncated buffer, or a
    /// length field that disagrees with the available bytes.
    Malformed(&'static str),
    /// Structurally sound frame whose XOR byte does not match.
    Integrity,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { len } => {
                write!(f, "payload of {len} bytes exceeds the 255-byte frame limit")
            }
            Self::Malformed(reason) => write!(f, "malformed frame: {reason}"),
            Self::Integrity => write!(f, "frame XOR integrity check failed"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode `(command, sequence, payload)` into wire bytes.
pub fn encode(command: u8, sequence: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = MIN_FRAME_LEN + payload.len();
    if length > MAX_FRAME_LEN {
        return Err(FrameError::PayloadTooLarge { len: payload.len() });
    }

    let mut out = Vec::with_capacity(length);
    out.push(HEADER);
    out.push(length as u8);
    out.push(command);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(payload);

    let xor = out.iter().fold(0u8, |acc, b| acc ^ b);
    out.push(xor);
    out.push(TAIL);

    Ok(out)
}

/// Decode one frame starting at `buf[0]`. `buf[0]` must already be
/// `HEADER` — callers resynchronizing a stream scan forward to the next
/// `HEADER` byte themselves (transport responsibility, spec §4.2).
///
/// Returns the parsed frame and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(FrameError::Malformed("buffer shorter than minimum frame size"));
    }
    if buf[0] != HEADER {
        return Err(FrameError::Malformed("bad header byte"));
    }

    let length = buf[1] as usize;
    if length < MIN_FRAME_LEN {
        return Err(FrameError::Malformed("length field below minimum frame size"));
    }
    if buf.len() < length {
        return Err(FrameError::Malformed("buffer shorter than declared length"));
    }
    if buf[length - 1] != TAIL {
        return Err(FrameError::Malformed("bad tail byte"));
    }

    let command = buf[2];
    let sequence = u16::from_le_bytes([buf[3], buf[4]]);
    let data = buf[5..length - 2].to_vec();

    let declared_xor = buf[length - 2];
    let computed_xor = buf[..length - 2].iter().fold(0u8, |acc, b| acc ^ b);
    if declared_xor != computed_xor {
        return Err(FrameError::Integrity);
    }

    Ok((
        Frame {
            command,
            sequence,
            data,
        },
        length,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_payload_lengths() {
        for len in 0..=MAX_PAYLOAD_LEN {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let wire = encode(0x01, 0x1234, &payload).expect("encode");
            let (frame, consumed) = decode(&wire).expect("decode");
            assert_eq!(consumed, wire.len());
            assert_eq!(frame.command, 0x01);
            assert_eq!(frame.sequence, 0x1234);
            assert_eq!(frame.data, payload);
        }
    }

    #[test]
    fn payload_over_248_bytes_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode(0x01, 0, &payload),
            Err(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD_LEN + 1
            })
        );
    }

    #[test]
    fn every_single_byte_corruption_is_caught() {
        let wire = encode(0x02, 7, &[1, 2, 3]).expect("encode");
        for i in 0..wire.len() {
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0xFF;
            match decode(&corrupted) {
                Ok((frame, _)) => {
                    // A corrupted byte must never decode to the same frame.
                    assert_ne!(
                        (frame.command, frame.sequence, frame.data.clone()),
                        (0x02, 7, vec![1, 2, 3]),
                        "byte {i} corruption silently decoded to the original frame"
                    );
                }
                Err(FrameError::Malformed(_)) | Err(FrameError::Integrity) => {}
                Err(other) => panic!("unexpected error variant: {other:?}"),
            }
        }
    }

    #[test]
    fn dispense_frame_matches_spec_s5() {
        // S5: dispense(count=20, speed=5), sequence=1.
        let payload = [20u8, 0, 5];
        let wire = encode(0x01, 1, &payload).expect("encode");
        let expected_xor = 0xAAu8 ^ 0x0A ^ 0x01 ^ 0x01 ^ 0x00 ^ 0x14 ^ 0x00 ^ 0x05;
        assert_eq!(
            wire,
            vec![0xAA, 0x0A, 0x01, 0x01, 0x00, 0x14, 0x00, 0x05, expected_xor, 0x55]
        );
    }

    #[test]
    fn rejects_truncated_buffer() {
        let wire = encode(0x01, 1, &[1, 2, 3]).unwrap();
        assert_eq!(
            decode(&wire[..wire.len() - 2]),
            Err(FrameError::Malformed("buffer shorter than declared length"))
        );
    }

    #[test]
    fn rejects_bad_header() {
        let mut wire = encode(0x01, 1, &[]).unwrap();
        wire[0] = 0x00;
        assert_eq!(decode(&wire), Err(FrameError::Malformed("bad header byte")));
    }
}
