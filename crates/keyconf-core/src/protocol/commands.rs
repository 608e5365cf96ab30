//! Protocol commands
//!
//! Defines the opcodes understood by the keyboard controller and the pin pair
//! payload most of them carry.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ProtocolError;

/// A logical pin pair identifying a button or LED. `0` means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pins {
    /// First pin
    pub pin1: u8,
    /// Second pin
    pub pin2: u8,
}

impl Pins {
    /// Pin pair from its two pins
    pub const fn new(pin1: u8, pin2: u8) -> Self {
        Self { pin1, pin2 }
    }

    /// Both pins unset
    pub fn is_unset(&self) -> bool {
        self.pin1 == 0 && self.pin2 == 0
    }

    /// Wire form, `pin1` first
    pub fn to_bytes(self) -> [u8; 2] {
        [self.pin1, self.pin2]
    }
}

impl fmt::Display for Pins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pin1, self.pin2)
    }
}

/// Controller commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// No operation
    None = 0x00,
    /// Liveness probe, echoed back by the controller
    Echo = 0x01,
    /// A key was pressed in the editor
    ButtonPressed = 0x02,
    /// A key was released in the editor
    ButtonReleased = 0x03,
    /// Switch to keyboard check mode
    ModeCheckKeyboard = 0x04,
    /// Switch to normal operation
    ModeRun = 0x05,
    /// Switch to layout configuration
    ModeConfigure = 0x06,
    /// Add an LED pin pair to the controller's diode table
    ModeDiodeConfig = 0x07,
    /// Remove an LED pin pair from the diode table
    ModeDiodeConfigDel = 0x08,
    /// Drop the whole diode table
    ModeDiodeClear = 0x09,
    /// An LED key was pressed
    DiodePressed = 0x0A,
    /// An LED key was released
    DiodeReleased = 0x0B,
    /// Inbound only: pin state plus lit LEDs
    StatusUpdate = 0x0C,
}

impl Command {
    /// Wire opcode
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Whether the controller acknowledges this command by echoing its opcode
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            Command::Echo
                | Command::ModeDiodeConfig
                | Command::ModeDiodeConfigDel
                | Command::ModeDiodeClear
        )
    }

    /// Whether the outbound frame carries a two-byte `Pins` payload
    pub fn carries_pins(self) -> bool {
        matches!(
            self,
            Command::ButtonPressed
                | Command::ButtonReleased
                | Command::ModeDiodeConfig
                | Command::ModeDiodeConfigDel
                | Command::DiodePressed
                | Command::DiodeReleased
        )
    }

    /// Variant name, as shown in logs
    pub fn name(self) -> &'static str {
        match self {
            Command::None => "None",
            Command::Echo => "Echo",
            Command::ButtonPressed => "ButtonPressed",
            Command::ButtonReleased => "ButtonReleased",
            Command::ModeCheckKeyboard => "ModeCheckKeyboard",
            Command::ModeRun => "ModeRun",
            Command::ModeConfigure => "ModeConfigure",
            Command::ModeDiodeConfig => "ModeDiodeConfig",
            Command::ModeDiodeConfigDel => "ModeDiodeConfigDel",
            Command::ModeDiodeClear => "ModeDiodeClear",
            Command::DiodePressed => "DiodePressed",
            Command::DiodeReleased => "DiodeReleased",
            Command::StatusUpdate => "StatusUpdate",
        }
    }

    /// Every opcode, in wire order
    pub const ALL: [Command; 13] = [
        Command::None,
        Command::Echo,
        Command::ButtonPressed,
        Command::ButtonReleased,
        Command::ModeCheckKeyboard,
        Command::ModeRun,
        Command::ModeConfigure,
        Command::ModeDiodeConfig,
        Command::ModeDiodeConfigDel,
        Command::ModeDiodeClear,
        Command::DiodePressed,
        Command::DiodeReleased,
        Command::StatusUpdate,
    ];
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::UnknownCommand(value))
    }
}

impl std::str::FromStr for Command {
    type Err = ProtocolError;

    /// Parse a command by name, ignoring case and `_`/`-` separators
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name: String = s.chars().filter(|c| *c != '_' && *c != '-').collect();
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(&name))
            .ok_or_else(|| ProtocolError::Config(format!("unknown command name '{}'", s)))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Editor work modes and the controller mode each one selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkMode {
    /// Normal operation: presses are mirrored to the device
    Work,
    /// Keyboard check: the device scans its pins and reports status
    Check,
    /// Layout editing
    Modify,
    /// LED assignment; keeps the controller in its current mode
    DiodeConf,
}

impl WorkMode {
    /// Mode command to send when switching into this work mode
    pub fn command(self) -> Option<Command> {
        match self {
            WorkMode::Work => Some(Command::ModeRun),
            WorkMode::Check => Some(Command::ModeCheckKeyboard),
            WorkMode::Modify => Some(Command::ModeConfigure),
            WorkMode::DiodeConf => None,
        }
    }
}

/// A command request that has not been encoded yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingCommand {
    /// Command to send
    pub command: Command,
    /// Pin payload, for commands that carry one
    pub pins: Option<Pins>,
}

impl OutgoingCommand {
    /// A command without pins
    pub fn new(command: Command) -> Self {
        Self { command, pins: None }
    }

    /// A command carrying `pins`
    pub fn with_pins(command: Command, pins: Pins) -> Self {
        Self {
            command,
            pins: Some(pins),
        }
    }
}
