//! # KeyConf Core Library
//!
//! Device communication layer for the KeyConf keyboard controller.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Checksummed frame encoding/decoding for the controller's serial protocol
//! - An acknowledged, paced command queue
//! - A connection manager that discovers the controller, monitors it with a
//!   heartbeat and reconnects on loss or hot-plug
//! - Diode table synchronisation
//! - A virtual controller for running without hardware
//! - A tokio task driving all of the above
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyconf_core::prelude::*;
//!
//! let config = ConnectionConfig::default();
//! let manager = ConnectionManager::new(
//!     SerialTransport::new(config.baud_rate),
//!     SystemPortLister,
//!     config,
//! );
//! let (link, mut events, _task) = spawn_link(manager);
//! link.start_auto_connect().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", event);
//! }
//! ```

pub mod diode_sync;
pub mod emulator;
pub mod protocol;
pub mod runtime;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::diode_sync::DiodeSync;
    pub use crate::emulator::{EmulatorHandle, VirtualController};
    pub use crate::protocol::{
        Command, ConnectionConfig, ConnectionManager, ConnectionState, LinkEvent, Pins,
        ProtocolError, SerialTransport, StatusPayload, SystemPortLister, WorkMode,
    };
    pub use crate::runtime::{spawn_link, wait_for_connection, LinkHandle};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
