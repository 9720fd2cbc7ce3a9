//! Newline-delimited JSON framing for the peerlink control stream.
//!
//! Outbound wire format: `<JSON envelope>\n`.
//!
//! Inbound, the decoder accepts envelopes separated by newlines or simply
//! written back to back, and tolerates a value split across reads.

use crate::error::{RelayError, RelayResult};
use crate::messages::Envelope;

/// Default upper bound for one pending inbound frame (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encode an envelope as one newline-terminated JSON frame.
pub fn frame_encode(envelope: &Envelope) -> RelayResult<Vec<u8>> {
    let mut frame = serde_json::to_vec(envelope)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode a single envelope from a complete byte slice.
pub fn decode_envelope(data: &[u8]) -> RelayResult<Envelope> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    Envelope::from_value(value)
}

enum Step {
    Value(serde_json::Value, usize),
    Incomplete,
    Invalid(String),
}

/// Streaming envelope decoder: accumulates bytes and yields complete messages.
///
/// Each yielded item is either a decoded envelope or the parse error for one
/// malformed message. A malformed message never poisons the decoder.
#[derive(Debug)]
pub struct EnvelopeDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl EnvelopeDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Feed bytes into the decoder and return every message completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<RelayResult<Envelope>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            match self.buffer.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    self.buffer.clear();
                    break;
                }
            }

            match self.next_step() {
                Step::Value(value, consumed) => {
                    self.buffer.drain(..consumed);
                    messages.push(Envelope::from_value(value));
                }
                Step::Incomplete => break,
                Step::Invalid(reason) => {
                    // Resynchronise on the next line.
                    let cut = self
                        .buffer
                        .iter()
                        .position(|&b| b == b'\n')
                        .map(|i| i + 1)
                        .unwrap_or(self.buffer.len());
                    self.buffer.drain(..cut);
                    messages.push(Err(RelayError::Parse(reason)));
                }
            }
        }

        if self.buffer.len() > self.max_frame_size {
            let size = self.buffer.len();
            self.buffer.clear();
            messages.push(Err(RelayError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }));
        }

        messages
    }

    fn next_step(&self) -> Step {
        let mut stream =
            serde_json::Deserializer::from_slice(&self.buffer).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value)) => Step::Value(value, stream.byte_offset()),
            Some(Err(e)) if e.is_eof() => Step::Incomplete,
            Some(Err(e)) => Step::Invalid(e.to_string()),
            None => Step::Incomplete,
        }
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
