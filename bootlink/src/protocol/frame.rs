//! Frames and the frame codec seam.
//!
//! Delimiting, escaping and frame CRC belong to the codec the integrator
//! provides. The endpoint only sees whole frames (a type code plus payload) or
//! spans of bytes the codec could not attribute to any frame.

/// Frame type code carrying the standard message set.
pub const STANDARD_FRAME_TYPE_CODE: u8 = 0xFF;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type code.
    pub type_code: u8,
    /// Frame payload, codec framing already removed.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(type_code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_code,
            payload: payload.into(),
        }
    }

    /// Create a frame of the standard type.
    pub fn standard(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(STANDARD_FRAME_TYPE_CODE, payload)
    }

    /// Whether this frame carries the standard message set.
    pub fn is_standard(&self) -> bool {
        self.type_code == STANDARD_FRAME_TYPE_CODE
    }
}

/// Output of the codec after consuming one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserOutput {
    /// A complete frame was received.
    Frame(Frame),
    /// Bytes that did not belong to any frame (line noise, debug prints).
    ExtraneousData(Vec<u8>),
}

/// Byte-level frame codec.
pub trait FrameCodec {
    /// Consume one input byte.
    ///
    /// Returns `Some` when the byte completes a frame or closes a span of
    /// unparsed data.
    fn process_next_byte(&mut self, byte: u8) -> Option<ParserOutput>;

    /// Encode a frame for transmission.
    fn encode(&self, type_code: u8, payload: &[u8]) -> Vec<u8>;
}

impl<T: FrameCodec + ?Sized> FrameCodec for Box<T> {
    fn process_next_byte(&mut self, byte: u8) -> Option<ParserOutput> {
        (**self).process_next_byte(byte)
    }

    fn encode(&self, type_code: u8, payload: &[u8]) -> Vec<u8> {
        (**self).encode(type_code, payload)
    }
}
