//! Protocol errors

use thiserror::Error;

/// Errors that can occur during device communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Opening or using the serial port failed
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Write attempted with no open port
    #[error("Port is not open")]
    NotOpen,

    /// No answer in time
    #[error("Response timeout")]
    Timeout,

    /// Payload does not fit a frame
    #[error("Frame too large: {len} payload bytes do not fit a one-byte length field")]
    FrameTooLarge {
        /// Offending payload length
        len: usize,
    },

    /// Status payload shorter than its LED count implies
    #[error("Malformed status payload: {declared} bytes declared, {available} available")]
    MalformedStatus {
        /// Bytes the LED count calls for
        declared: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Opcode outside the command set
    #[error("Unknown command opcode {0:#04x}")]
    UnknownCommand(u8),

    /// The link task has exited
    #[error("Link task has stopped")]
    LinkClosed,

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration file is not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
