//! WebSocket frame codec (RFC 6455 §5).
//!
//! Frames carry a 2-byte header, an optional extended length, an
//! optional 4-byte mask key, and the payload:
//!
//! ```text
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| length (7)  | extended length (16/64, BE)   |
//! |I|S|S|S|  (4)  |A|             | present iff length = 126/127  |
//! |N|V|V|V|       |S|             +-------------------------------+
//! | |1|2|3|       |K|             | mask key (32) iff MASK = 1    |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! | payload ...                                                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! This codec implements the server role: inbound frames must be
//! masked and are rejected otherwise, outbound frames are never
//! masked. Fragmentation is not supported; every frame must carry
//! FIN=1.

use std::io::{Read, Write};

use crate::DEFAULT_MAX_PAYLOAD;
use crate::error::{ProtocolError, ProtocolResult};

/// Frame type, from the low nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message (not supported).
    Continuation = 0x0,
    /// UTF-8 text payload.
    Text = 0x1,
    /// Opaque binary payload.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Keepalive probe.
    Ping = 0x9,
    /// Keepalive reply.
    Pong = 0xA,
}

impl Opcode {
    /// Parses an opcode nibble.
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    /// Returns true for control frames (close/ping/pong).
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One decoded frame.
///
/// Frames are transient: decoded, dispatched, dropped. The payload is
/// already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final-fragment flag. Always true for frames this codec accepts.
    pub fin: bool,
    /// Frame type.
    pub opcode: Opcode,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a final text frame.
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// Creates a close frame with an empty payload.
    pub fn close() -> Self {
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload: Vec::new(),
        }
    }

    /// Consumes the frame, returning the payload as a UTF-8 string.
    pub fn into_text(self) -> ProtocolResult<String> {
        Ok(String::from_utf8(self.payload)?)
    }
}

/// Parsed 2-byte frame header, before extended length and mask key.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Final-fragment flag (byte 0, bit 7).
    pub fin: bool,
    /// Frame type (byte 0, low nibble).
    pub opcode: Opcode,
    /// Mask flag (byte 1, bit 7).
    pub masked: bool,
    /// Base payload length (byte 1, bits 0-6): the true length if
    /// <= 125, otherwise 126/127 selecting a 16/64-bit extension.
    pub base_len: u8,
}

impl FrameHeader {
    /// Parses the two header bytes of a client frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownOpcode`] for an unassigned opcode.
    /// - [`ProtocolError::UnsupportedFragment`] for FIN=0 or a
    ///   continuation frame.
    /// - [`ProtocolError::UnmaskedFrame`] if the mask bit is clear.
    pub fn parse(b0: u8, b1: u8) -> ProtocolResult<Self> {
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F)?;

        if !fin || opcode == Opcode::Continuation {
            return Err(ProtocolError::UnsupportedFragment);
        }

        let masked = b1 & 0x80 != 0;
        if !masked {
            return Err(ProtocolError::UnmaskedFrame);
        }

        Ok(Self {
            fin,
            opcode,
            masked,
            base_len: b1 & 0x7F,
        })
    }

    /// Number of extended-length bytes that follow the header.
    pub fn extended_len_bytes(&self) -> usize {
        match self.base_len {
            126 => 2,
            127 => 8,
            _ => 0,
        }
    }

    /// Resolves the true payload length from the extension bytes.
    ///
    /// `ext` must have exactly [`extended_len_bytes`] bytes.
    ///
    /// [`extended_len_bytes`]: Self::extended_len_bytes
    pub fn payload_len(&self, ext: &[u8]) -> u64 {
        match self.base_len {
            126 => u16::from_be_bytes([ext[0], ext[1]]) as u64,
            127 => u64::from_be_bytes([
                ext[0], ext[1], ext[2], ext[3], ext[4], ext[5], ext[6], ext[7],
            ]),
            n => n as u64,
        }
    }
}

/// XORs the payload in place with the repeating 4-byte mask key.
///
/// Masking is an involution, so the same call masks and unmasks.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encodes a server-to-client frame (FIN=1, never masked).
///
/// The header grows with the payload: lengths up to 125 fit in the
/// second header byte, up to 65535 use a 16-bit extension, larger
/// payloads an a 64-bit extension.
///
/// # Example
///
/// ```rust
/// use shoal_protocol::{Opcode, encode_frame};
///
/// let bytes = encode_frame(Opcode::Text, b"hi");
/// assert_eq!(bytes, [0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut buffer = encode_header(opcode, payload.len() as u64, None);
    buffer.extend_from_slice(payload);
    buffer
}

/// Encodes a client-to-server frame, masking the payload.
///
/// The server never produces masked frames; this exists for clients
/// and for exercising the decode path in tests.
pub fn encode_frame_masked(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut buffer = encode_header(opcode, payload.len() as u64, Some(key));
    let start = buffer.len();
    buffer.extend_from_slice(payload);
    apply_mask(&mut buffer[start..], key);
    buffer
}

fn encode_header(opcode: Opcode, len: u64, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let mut buffer = Vec::with_capacity(14 + len as usize);

    buffer.push(0x80 | opcode as u8);
    if len <= 125 {
        buffer.push(mask_bit | len as u8);
    } else if len <= u16::MAX as u64 {
        buffer.push(mask_bit | 126);
        buffer.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buffer.push(mask_bit | 127);
        buffer.extend_from_slice(&len.to_be_bytes());
    }

    if let Some(key) = mask {
        buffer.extend_from_slice(&key);
    }

    buffer
}

/// Reads client frames from a byte stream.
///
/// This is the synchronous decode path, used by test clients and
/// tooling; the server drives the same header logic with async reads.
pub struct FrameReader<R> {
    reader: R,
    max_payload: u64,
}

impl<R: Read> FrameReader<R> {
    /// Creates a new FrameReader with the default payload cap.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Builder: set the maximum accepted payload length.
    pub fn with_max_payload(mut self, max: u64) -> Self {
        self.max_payload = max;
        self
    }

    /// Reads a single frame.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. An EOF
    /// in the middle of a frame is an error.
    pub fn read_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        let mut header = [0u8; 2];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let header = FrameHeader::parse(header[0], header[1])?;

        let mut ext = [0u8; 8];
        let ext = &mut ext[..header.extended_len_bytes()];
        self.reader.read_exact(ext)?;

        let len = header.payload_len(ext);
        if len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }

        let mut key = [0u8; 4];
        self.reader.read_exact(&mut key)?;

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        apply_mask(&mut payload, key);

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        }))
    }

    /// Unwraps this FrameReader, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes frames to a byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    /// Creates a new FrameWriter wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes an unmasked frame (server role).
    pub fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) -> ProtocolResult<()> {
        self.writer.write_all(&encode_frame(opcode, payload))?;
        Ok(())
    }

    /// Writes a masked frame (client role).
    pub fn write_masked(
        &mut self,
        opcode: Opcode,
        payload: &[u8],
        key: [u8; 4],
    ) -> ProtocolResult<()> {
        self.writer
            .write_all(&encode_frame_masked(opcode, payload, key))?;
        Ok(())
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> ProtocolResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Unwraps this FrameWriter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
