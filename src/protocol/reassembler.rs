//! Streaming frame reassembly.
//!
//! [`FrameReassembler`] accumulates raw byte chunks (binary mode) or whole lines
//! (text mode) and yields validated [`Frame`]s. Framing failures never abort the
//! stream; they are counted and the scanner resynchronises on the next magic.

use super::frame::{
    crc16, decode_payload, DecodeError, Frame, TextLayout, CRC_LEN, FRAME_MAGIC, HEADER_LEN,
    PAYLOAD_LEN,
};
use bytes::{Buf, BytesMut};
use serde::Serialize;
use tracing::debug;

/// Cumulative reassembly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    /// Frames that passed CRC (binary) or decoded cleanly (text)
    pub frames: u64,
    /// Binary frames discarded on CRC mismatch
    pub crc_errors: u64,
    /// Binary frames discarded because the declared length was not 19
    pub length_errors: u64,
    /// Text records that failed to decode
    pub decode_errors: u64,
}

/// Stateful accumulator turning a raw stream into frames.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: BytesMut,
    layout: TextLayout,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and the learned text header. Counters are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.layout = TextLayout::default();
    }

    /// Feed a binary chunk and return every complete, valid frame it finished.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_magic(&self.buffer) else {
                self.buffer.clear();
                break;
            };
            if start > 0 {
                self.buffer.advance(start);
            }
            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let declared = usize::from(self.buffer[2]);
            let frame_end = HEADER_LEN + declared + CRC_LEN;
            if self.buffer.len() < frame_end {
                break;
            }

            if declared != PAYLOAD_LEN {
                self.stats.length_errors += 1;
                debug!(declared, "discarding frame with unexpected length");
                self.buffer.advance(frame_end);
                continue;
            }

            let payload = &self.buffer[HEADER_LEN..HEADER_LEN + PAYLOAD_LEN];
            let expected =
                u16::from_le_bytes([self.buffer[frame_end - 2], self.buffer[frame_end - 1]]);
            let actual = crc16(payload);
            if actual != expected {
                self.stats.crc_errors += 1;
                debug!(expected, actual, "discarding frame with bad CRC");
                self.buffer.advance(frame_end);
                continue;
            }

            match decode_payload(payload) {
                Ok(frame) => {
                    self.stats.frames += 1;
                    frames.push(frame);
                }
                Err(err) => {
                    self.stats.decode_errors += 1;
                    debug!(error = %err, "discarding undecodable payload");
                }
            }
            self.buffer.advance(frame_end);
        }

        frames
    }

    /// Feed one text line.
    ///
    /// Blank lines, `#` comments and header lines yield `Ok(None)`; a header line
    /// replaces the column mapping. A malformed record is counted and returned as an
    /// error for that line only.
    pub fn push_line(&mut self, line: &str) -> Result<Option<Frame>, DecodeError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }
        if TextLayout::is_header(trimmed) {
            match TextLayout::from_header(trimmed) {
                Ok(layout) => {
                    self.layout = layout;
                    return Ok(None);
                }
                Err(err) => {
                    self.stats.decode_errors += 1;
                    return Err(err);
                }
            }
        }
        match self.layout.decode(trimmed) {
            Ok(frame) => {
                self.stats.frames += 1;
                Ok(Some(frame))
            }
            Err(err) => {
                self.stats.decode_errors += 1;
                Err(err)
            }
        }
    }
}

fn find_magic(buffer: &[u8]) -> Option<usize> {
    buffer.windows(FRAME_MAGIC.len()).position(|w| w == FRAME_MAGIC)
}
