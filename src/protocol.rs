//! Wire protocol for the sync connection.
//!
//! Every unit on the wire is a frame: `opcode:u8 | len:u32 LE | payload`.
//! There is no magic, no version field, and no checksum. The only other
//! bytes ever written outside a frame are the raw API key sent once at
//! connect time.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size: opcode byte plus 4-byte payload length.
pub const HEADER_LEN: usize = 1 + 4;

/// Maximum accepted payload length (64MB). A corrupt or hostile length
/// prefix must not drive an unbounded allocation; anything above this cap
/// is a fatal decode error and ends the connection.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

// =============================================================================
// Opcodes
// =============================================================================

/// Recognized frame opcodes. Any other byte value is treated by the engine
/// as a request to close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Carries a manifest: newline-joined relative file paths. Outbound it
    /// lists the sender's own files, inbound it lists files the peer wants.
    Init = 0x00,
    /// Announces the relative path of a file about to be streamed.
    NewFilePath = 0x01,
    /// One chunk of the announced file's bytes, in order, no chunk index.
    NewFilePart = 0x02,
    /// Marks completion of the file named in the payload.
    NewFileEnd = 0x03,
    /// Terminates the connection.
    Close = 0x04,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Init),
            0x01 => Some(Self::NewFilePath),
            0x02 => Some(Self::NewFilePart),
            0x03 => Some(Self::NewFileEnd),
            0x04 => Some(Self::Close),
            _ => None,
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

/// One decoded protocol frame. The opcode is kept raw so the engine can
/// apply the unknown-opcode-closes-connection policy itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: opcode as u8,
            payload: payload.into(),
        }
    }
}

/// Encode one frame: opcode byte, little-endian payload length, payload
/// verbatim.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(opcode as u8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

// =============================================================================
// Decoder
// =============================================================================

/// Stateful frame decoder. Holds bytes left over from previous deliveries
/// so frames split across arbitrary TCP segment boundaries reassemble
/// exactly as if the stream had arrived in one piece.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delivery of raw bytes, returning every frame that is now
    /// complete. Underflow (partial header or partial payload) is not an
    /// error; the remainder is buffered for the next call. The only error
    /// is a declared payload length above [`MAX_FRAME_SIZE`]. Frames that
    /// completed ahead of a corrupt header are still returned; the header
    /// stays buffered and the error surfaces on the following call, so
    /// what gets processed before the failure does not depend on how the
    /// stream was chunked.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
            if len > MAX_FRAME_SIZE {
                if frames.is_empty() {
                    anyhow::bail!(
                        "frame payload length {} exceeds maximum {}",
                        len,
                        MAX_FRAME_SIZE
                    );
                }
                break;
            }
            let total = HEADER_LEN + len as usize;
            if self.buf.len() < total {
                break;
            }
            let opcode = self.buf[0];
            let mut frame = self.buf.split_to(total);
            frame.advance(HEADER_LEN);
            frames.push(Frame {
                opcode,
                payload: frame.freeze(),
            });
        }
        Ok(frames)
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// Encode a manifest payload: relative paths joined by a single newline.
/// An empty manifest is the empty string.
pub fn encode_manifest<S: AsRef<str>>(paths: &[S]) -> Bytes {
    let joined = paths
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    Bytes::from(joined.into_bytes())
}

/// Parse a manifest payload into relative paths. Blank entries are skipped,
/// matching how the server side has always filtered them.
pub fn parse_manifest(payload: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| anyhow::anyhow!("invalid UTF-8 in manifest: {}", e))?;
    Ok(text
        .split('\n')
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
