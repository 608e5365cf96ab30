//! Serial Protocol Communication
//!
//! Implements the KeyConf controller protocol: checksummed frames over a
//! serial byte stream, an acknowledged command queue, and a connection
//! manager that finds the controller and keeps the link alive.
//!
//! Wire format of a frame:
//!
//! ```text
//! +------+--------+---------+-----------------+----------+
//! | 0xAA | LENGTH | COMMAND | PAYLOAD (0..n)  | CHECKSUM |
//! +------+--------+---------+-----------------+----------+
//! ```
//!
//! LENGTH counts COMMAND, PAYLOAD and CHECKSUM. CHECKSUM is the wrapping sum
//! of every preceding byte of the frame, including SOF and LENGTH.
//!
//! Nothing in this module sleeps or spawns; time is passed in explicitly and
//! [`ConnectionManager::next_deadline`] tells the caller when to poll again.

pub mod commands;
mod connection;
mod error;
mod events;
mod link;
pub mod packet;
mod queue;
pub mod serial;
mod status;
pub mod timer;
mod transport;

pub use commands::{Command, OutgoingCommand, Pins, WorkMode};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::ProtocolError;
pub use events::LinkEvent;
pub use link::DeviceLink;
pub use packet::{decode, encode, encode_command, Frame, FrameDecoder};
pub use queue::{CommandQueue, QueuedCommand};
pub use serial::{
    clear_buffers, configure_port, list_ports, open_port, PortInfo, SerialTransport,
    SystemPortLister,
};
pub use status::StatusPayload;
pub use timer::Deadline;
pub use transport::{PortLister, StaticPortLister, Transport};

/// Start-of-frame marker
pub const SOF: u8 = 0xAA;

/// Largest payload that still fits the one-byte LENGTH field
pub const MAX_PAYLOAD_SIZE: usize = 253;

/// Default baud rate for controller communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// How long an acknowledged command may block the queue
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 200;

/// Pacing delay between consecutive commands
pub const DEFAULT_INTER_COMMAND_DELAY_MS: u64 = 5;

/// Echo reply timeout during probing and heartbeats
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Echo period while connected
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5000;

/// Hot-plug poll period while disconnected
pub const DEFAULT_PORT_POLL_INTERVAL_MS: u64 = 2000;

/// Read poll period of the runtime while a port is open
pub const DEFAULT_READ_POLL_INTERVAL_MS: u64 = 2;
