//! Message framing
//!
//! Defines the wire format shared by both ends of a connection: a fixed
//! binary header followed by an optional extension block and the payload.
//! `FrameDecoder` reassembles messages from a TCP byte stream no matter how
//! the transport chunks the reads; for UDP one datagram is one frame and
//! `Message::decode` parses it whole.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::FrameError;

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 32;

/// Upper bound on the extension block carried by one message.
pub const MAX_EXTENSION: usize = 256;

/// Default upper bound on the payload carried by one message.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// One unit of application data.
///
/// Header layout, all fields big endian:
///
/// | bytes  | field            |
/// |--------|------------------|
/// | 0..8   | source           |
/// | 8..16  | destination      |
/// | 16..20 | payload length   |
/// | 20..22 | kind             |
/// | 22..30 | sent_at (millis) |
/// | 30..32 | extension length |
///
/// The extension block follows the header, then the payload. Payload and
/// extension bytes are opaque to the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Origin identifier. On a server, inbound messages have this overwritten
    /// with the id of the client the bytes arrived from.
    pub source: u64,
    /// Destination identifier, left to the application to interpret.
    pub destination: u64,
    /// Application-defined message type tag.
    pub kind: u16,
    /// Milliseconds since the Unix epoch at construction time.
    pub sent_at: u64,
    pub extension: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a message stamped with the current time and no extension.
    pub fn new(source: u64, destination: u64, kind: u16, payload: Vec<u8>) -> Self {
        Self {
            source,
            destination,
            kind,
            sent_at: now_millis(),
            extension: Vec::new(),
            payload,
        }
    }

    /// Attaches an opaque header extension.
    pub fn with_extension(mut self, extension: Vec<u8>) -> Self {
        self.extension = extension;
        self
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Serializes the message into one frame, enforcing the size caps.
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: self.payload.len(),
                max: max_payload,
            });
        }
        if self.extension.len() > MAX_EXTENSION {
            return Err(FrameError::ExtensionTooLarge {
                size: self.extension.len(),
                max: MAX_EXTENSION,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + self.extension.len() + self.payload.len());
        frame.extend_from_slice(&self.source.to_be_bytes());
        frame.extend_from_slice(&self.destination.to_be_bytes());
        frame.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&self.kind.to_be_bytes());
        frame.extend_from_slice(&self.sent_at.to_be_bytes());
        frame.extend_from_slice(&(self.extension.len() as u16).to_be_bytes());
        frame.extend_from_slice(&self.extension);
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }

    /// Parses one complete frame, e.g. a UDP datagram.
    pub fn decode(frame: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        let header = Header::parse(frame, max_payload)?;
        let total = HEADER_LEN + header.extension_len + header.payload_len;
        if frame.len() < total {
            return Err(FrameError::Truncated {
                expected: total,
                actual: frame.len(),
            });
        }
        Ok(header.assemble(&frame[HEADER_LEN..total]))
    }
}

/// Parsed fixed header, sizes already validated against the caps.
struct Header {
    source: u64,
    destination: u64,
    payload_len: usize,
    kind: u16,
    sent_at: u64,
    extension_len: usize,
}

impl Header {
    /// Parses and validates the fixed header. Declared lengths are checked
    /// against the caps here, before any buffering decision is made on them.
    fn parse(bytes: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let payload_len = read_u32(bytes, 16) as usize;
        if payload_len > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: max_payload,
            });
        }
        let extension_len = read_u16(bytes, 30) as usize;
        if extension_len > MAX_EXTENSION {
            return Err(FrameError::ExtensionTooLarge {
                size: extension_len,
                max: MAX_EXTENSION,
            });
        }

        Ok(Self {
            source: read_u64(bytes, 0),
            destination: read_u64(bytes, 8),
            payload_len,
            kind: read_u16(bytes, 20),
            sent_at: read_u64(bytes, 22),
            extension_len,
        })
    }

    /// Combines the header with its body (extension followed by payload).
    fn assemble(&self, body: &[u8]) -> Message {
        let (extension, payload) = body.split_at(self.extension_len);
        Message {
            source: self.source,
            destination: self.destination,
            kind: self.kind,
            sent_at: self.sent_at,
            extension: extension.to_vec(),
            payload: payload.to_vec(),
        }
    }
}

/// Accumulates bytes from a TCP stream and pops complete messages.
///
/// Short reads are not errors; `next_message` returns `Ok(None)` until a full
/// header-declared frame is buffered. A header whose declared sizes exceed
/// the caps poisons the stream and is returned as an error.
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    /// Appends freshly read bytes to the internal buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete message, or `None` when more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::parse(&self.buf, self.max_payload)?;
        let total = HEADER_LEN + header.extension_len + header.payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Ok(Some(header.assemble(&frame[HEADER_LEN..])))
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[at..at + 2]);
    u16::from_be_bytes(buf)
}

/// Milliseconds since the Unix epoch, saturating at zero before it.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
