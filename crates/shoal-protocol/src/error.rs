//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame payload exceeds the maximum allowed size.
    ///
    /// Raised before the payload buffer is allocated, so a hostile
    /// length field cannot trigger an oversized allocation.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    /// A client frame arrived without the mask bit set.
    ///
    /// Clients must mask every frame they send; an unmasked frame is
    /// rejected outright rather than parsed with guessed framing.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// Opcode nibble does not name a known frame type.
    #[error("unknown opcode: {0:#x}")]
    UnknownOpcode(u8),

    /// Fragmented message (FIN=0 or a continuation frame).
    ///
    /// Message reassembly is not supported; every frame must be
    /// self-contained.
    #[error("fragmented frames are not supported")]
    UnsupportedFragment,

    /// Text frame payload is not valid UTF-8.
    #[error("text payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// IO error during read/write. Also covers a stream that ends in
    /// the middle of a frame (`UnexpectedEof`).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
