//! Frame encoding and decoding for the stream multiplexer.
//!
//! Every multiplexer frame travels as exactly one encrypted session record.
//! All multi-byte fields are big-endian (network byte order).
//!
//! ```text
//! 0               4       5               9
//! +---------------+-------+---------------+-------------------+
//! |   stream_id   | type  |  payload_len  |  payload ...      |
//! +---------------+-------+---------------+-------------------+
//! ```

use thiserror::Error;

/// Fixed frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest payload a single frame may carry
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024;

/// Frame-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Invalid frame type byte
    #[error("invalid frame type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// Reserved frame type used
    #[error("reserved frame type used")]
    ReservedFrameType,

    /// Declared payload length does not match the record
    #[error("payload length mismatch: declared {declared}, actual {actual}")]
    PayloadLengthMismatch {
        /// Length in the header
        declared: usize,
        /// Bytes actually following the header
        actual: usize,
    },

    /// Payload exceeds [`MAX_FRAME_PAYLOAD`]
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Frame payload is malformed for its type
    #[error("malformed {0:?} frame")]
    Malformed(FrameType),
}

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// New stream initiation
    Open = 0x01,
    /// Stream data
    Data = 0x02,
    /// Sender will write no more data on this stream
    Fin = 0x03,
    /// Abort stream in both directions
    Reset = 0x04,
    /// Flow control credit
    Window = 0x05,
    /// Connection is going away
    GoAway = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Err(FrameError::ReservedFrameType),
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Fin),
            0x04 => Ok(Self::Reset),
            0x05 => Ok(Self::Window),
            0x06 => Ok(Self::GoAway),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// One multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the frame belongs to (0 for connection-level frames)
    pub stream_id: u32,
    /// Frame type
    pub frame_type: FrameType,
    /// Type-specific payload
    pub payload: Vec<u8>,
}

impl Frame {
    fn new(stream_id: u32, frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    /// Open a new stream
    #[must_use]
    pub fn open(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Open, Vec::new())
    }

    /// Carry stream data
    #[must_use]
    pub fn data(stream_id: u32, payload: Vec<u8>) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Half-close the sending direction
    #[must_use]
    pub fn fin(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Fin, Vec::new())
    }

    /// Abort a stream
    #[must_use]
    pub fn reset(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Reset, Vec::new())
    }

    /// Grant `credit` more bytes of send window
    #[must_use]
    pub fn window(stream_id: u32, credit: u32) -> Self {
        Self::new(stream_id, FrameType::Window, credit.to_be_bytes().to_vec())
    }

    /// Announce connection shutdown
    #[must_use]
    pub fn go_away() -> Self {
        Self::new(0, FrameType::GoAway, Vec::new())
    }

    /// Credit carried by a `Window` frame
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] if this is not a well-formed
    /// `Window` frame.
    pub fn window_credit(&self) -> Result<u32, FrameError> {
        if self.frame_type != FrameType::Window {
            return Err(FrameError::Malformed(self.frame_type));
        }
        let bytes: [u8; 4] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| FrameError::Malformed(FrameType::Window))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Serialize to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse from one record
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first problem found.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let frame_type = FrameType::try_from(data[4])?;
        let declared = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        let payload = &data[FRAME_HEADER_SIZE..];

        if declared > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(declared));
        }
        if declared != payload.len() {
            return Err(FrameError::PayloadLengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Self::new(stream_id, frame_type, payload.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = Frame::data(7, b"hello".to_vec());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 5);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_window_credit() {
        let frame = Frame::decode(&Frame::window(3, 65_536).encode()).unwrap();
        assert_eq!(frame.window_credit().unwrap(), 65_536);
        assert!(Frame::fin(3).window_credit().is_err());
    }

    #[test]
    fn test_malformed_window() {
        let frame = Frame {
            stream_id: 1,
            frame_type: FrameType::Window,
            payload: vec![1, 2],
        };
        assert_eq!(
            frame.window_credit(),
            Err(FrameError::Malformed(FrameType::Window))
        );
    }

    #[test]
    fn test_too_short() {
        assert_eq!(
            Frame::decode(&[0, 0, 0]),
            Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: 3
            })
        );
    }

    #[test]
    fn test_reserved_and_unknown_types() {
        let mut encoded = Frame::open(1).encode();
        encoded[4] = 0x00;
        assert_eq!(Frame::decode(&encoded), Err(FrameError::ReservedFrameType));
        encoded[4] = 0x7F;
        assert_eq!(
            Frame::decode(&encoded),
            Err(FrameError::InvalidFrameType(0x7F))
        );
    }

    #[test]
    fn test_length_mismatch() {
        let mut encoded = Frame::data(1, vec![0; 4]).encode();
        encoded.pop();
        assert_eq!(
            Frame::decode(&encoded),
            Err(FrameError::PayloadLengthMismatch {
                declared: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_payload_too_large() {
        let mut encoded = Frame::open(1).encode();
        encoded[5..9].copy_from_slice(&((MAX_FRAME_PAYLOAD + 1) as u32).to_be_bytes());
        assert_eq!(
            Frame::decode(&encoded),
            Err(FrameError::PayloadTooLarge(MAX_FRAME_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_go_away_uses_stream_zero() {
        assert_eq!(Frame::go_away().stream_id, 0);
    }
}
