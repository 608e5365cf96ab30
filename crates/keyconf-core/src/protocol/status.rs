//! Status update payload
//!
//! The controller reports pin state and the LEDs it currently drives:
//! `pin1 | pin2 | leds_num | (led.pin1 | led.pin2) * leds_num`.

use serde::{Deserialize, Serialize};

use super::{Command, Frame, Pins, ProtocolError};

/// Decoded `StatusUpdate` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Pin pair currently reported by the controller
    pub pins: Pins,
    /// Lit LEDs, in wire order
    pub leds: Vec<Pins>,
}

impl StatusPayload {
    /// Status with `pins` and the given lit LEDs
    pub fn new(pins: Pins, leds: Vec<Pins>) -> Self {
        Self { pins, leds }
    }

    /// Decode a status payload, rejecting LED counts that overrun it
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 3 {
            return Err(ProtocolError::MalformedStatus {
                declared: 3,
                available: payload.len(),
            });
        }

        let pins = Pins::new(payload[0], payload[1]);
        let leds_num = payload[2] as usize;
        let declared = 3 + leds_num * 2;
        if declared > payload.len() {
            return Err(ProtocolError::MalformedStatus {
                declared,
                available: payload.len(),
            });
        }

        let leds = payload[3..declared]
            .chunks_exact(2)
            .map(|pair| Pins::new(pair[0], pair[1]))
            .collect();

        Ok(Self { pins, leds })
    }

    /// Decode a frame whose command is `StatusUpdate`
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        if frame.opcode != Command::StatusUpdate.opcode() {
            return Err(ProtocolError::UnknownCommand(frame.opcode));
        }
        Self::from_payload(&frame.payload)
    }

    /// Encode back to payload bytes. The LED count must fit its one-byte field.
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = 3 + self.leds.len() * 2;
        let leds_num =
            u8::try_from(self.leds.len()).map_err(|_| ProtocolError::FrameTooLarge { len })?;

        let mut payload = Vec::with_capacity(len);
        payload.extend_from_slice(&self.pins.to_bytes());
        payload.push(leds_num);
        for led in &self.leds {
            payload.extend_from_slice(&led.to_bytes());
        }
        Ok(payload)
    }
}
