//! WebSocket wire protocol for shoal.
//!
//! This crate is the pure protocol layer: no IO policy, no runtime.
//! It provides the frame codec (RFC 6455 §5, server role) and the
//! computational side of the upgrade handshake (§4).
//!
//! # Frame format
//!
//! Frames are length-prefixed with a variable-width header: a 7-bit
//! base length, escaping to a 16-bit or 64-bit big-endian extension
//! for larger payloads. Client frames carry a 4-byte mask key XORed
//! over the payload; server frames never do.
//!
//! # Example
//!
//! ```rust
//! use shoal_protocol::{FrameReader, Opcode, encode_frame_masked};
//! use std::io::Cursor;
//!
//! let wire = encode_frame_masked(Opcode::Text, b"hello", [1, 2, 3, 4]);
//! let mut reader = FrameReader::new(Cursor::new(wire));
//! let frame = reader.read_frame().unwrap().unwrap();
//! assert_eq!(frame.payload, b"hello");
//! ```

mod error;
mod frame;
mod handshake;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    Frame, FrameHeader, FrameReader, FrameWriter, Opcode, apply_mask, encode_frame,
    encode_frame_masked,
};
pub use handshake::{
    HandshakeError, UpgradeRequest, WS_GUID, accept_response, compute_accept_key,
};

/// Default maximum accepted payload length (1 MiB).
///
/// A cap must be applied before allocating the payload buffer; the
/// length field alone can claim up to 2^63-1 bytes.
pub const DEFAULT_MAX_PAYLOAD: u64 = 1024 * 1024;
