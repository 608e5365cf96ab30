//! Frame encoding/decoding
//!
//! Frame format (both directions):
//! - 1 byte: SOF (0xAA)
//! - 1 byte: LENGTH, counting COMMAND through CHECKSUM
//! - 1 byte: COMMAND
//! - N bytes: payload
//! - 1 byte: CHECKSUM, low byte of the sum of every preceding byte

use super::{Command, Pins, ProtocolError, MAX_PAYLOAD_SIZE, SOF};

/// A validated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw command byte
    pub opcode: u8,
    /// Bytes between COMMAND and CHECKSUM
    pub payload: Vec<u8>,
}

impl Frame {
    /// Frame for `command` carrying `payload`
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self {
            opcode: command.opcode(),
            payload,
        }
    }

    /// Typed command, if the opcode is known
    pub fn command(&self) -> Result<Command, ProtocolError> {
        Command::try_from(self.opcode)
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_raw(self.opcode, &self.payload)
    }
}

/// Low byte of the arithmetic sum of `data`
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Encode a command and payload into a wire frame
pub fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode_raw(command.opcode(), payload)
}

fn encode_raw(opcode: u8, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge { len: payload.len() });
    }

    let mut bytes = Vec::with_capacity(payload.len() + 4);
    bytes.push(SOF);
    bytes.push((payload.len() + 2) as u8);
    bytes.push(opcode);
    bytes.extend_from_slice(payload);
    bytes.push(checksum(&bytes));
    Ok(bytes)
}

/// Build the frame for an outbound command.
///
/// Pin-carrying commands always get a two-byte payload (`0-0` when no pins are
/// given); every other command is sent without payload.
pub fn encode_command(command: Command, pins: Option<Pins>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(6);
    bytes.push(SOF);
    if command.carries_pins() {
        let pins = pins.unwrap_or_default();
        bytes.extend_from_slice(&[4, command.opcode(), pins.pin1, pins.pin2]);
    } else {
        bytes.extend_from_slice(&[2, command.opcode()]);
    }
    bytes.push(checksum(&bytes));
    bytes
}

/// Try to decode one frame from the front of `buffer`.
///
/// Returns the decoded frame (if any) and how many bytes were consumed from the
/// front of the buffer. Consumed bytes include skipped garbage and rejected
/// frames; whatever remains is an incomplete frame waiting for more input.
pub fn decode(buffer: &[u8]) -> (Option<Frame>, usize) {
    let mut pos = 0;

    loop {
        match buffer[pos..].iter().position(|&b| b == SOF) {
            Some(offset) => pos += offset,
            None => return (None, buffer.len()),
        }

        let rest = &buffer[pos..];
        if rest.len() < 3 {
            return (None, pos);
        }

        let length = rest[1] as usize;
        let total = length + 2;
        if rest.len() < total {
            return (None, pos);
        }

        let candidate = &rest[..total];
        pos += total;

        if length < 2 {
            tracing::debug!("Dropping frame with impossible length {}", length);
            continue;
        }

        let expected = checksum(&candidate[..total - 1]);
        let actual = candidate[total - 1];
        if expected != actual {
            tracing::debug!(
                "Dropping frame with bad checksum: got {:#04x}, calculated {:#04x}",
                actual,
                expected
            );
            continue;
        }

        let frame = Frame {
            opcode: candidate[2],
            payload: candidate[3..total - 1].to_vec(),
        };
        return (Some(frame), pos);
    }
}

/// Accumulating receive buffer that yields validated frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, or `None` once only a partial frame is left
    pub fn next_frame(&mut self) -> Option<Frame> {
        let (frame, consumed) = decode(&self.buffer);
        self.buffer.drain(..consumed);
        frame
    }

    /// Drain every complete frame currently buffered
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Discard buffered bytes, including any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
