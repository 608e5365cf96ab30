//! Virtual controller
//!
//! In-process emulation of the keyboard controller firmware, for tests and
//! for running the CLI without hardware.
//!
//! - `Run`: a button press with both pins in 1..=15 is answered with a status
//!   frame lighting that pin pair.
//! - `CheckKeyboard`: every check interval the controller reports pin pair
//!   `(i, i)` with no LEDs, cycling `i` through 1..=15. Presses are answered
//!   as in `Run`.
//! - `Configure`: presses are ignored.
//! - `DiodeConfig`: entered by any diode table command. Presses are ignored
//!   until the host sends a mode command again.
//!
//! Echo and the diode table commands are acknowledged in every mode.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::protocol::{
    encode, Command, Frame, FrameDecoder, Pins, PortLister, ProtocolError, StatusPayload,
    Transport,
};

/// Highest pin number the controller scans
pub const MAX_PIN: u8 = 15;

/// Default period of check-mode status reports
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Firmware operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    /// Normal operation
    Run,
    /// Periodic pin sweep
    CheckKeyboard,
    /// Layout configuration; presses ignored
    Configure,
    /// Diode table editing; presses ignored
    DiodeConfig,
}

/// Firmware state machine. Bytes in, bytes out; no I/O.
#[derive(Debug)]
pub struct VirtualController {
    mode: ControllerMode,
    diodes: BTreeSet<Pins>,
    decoder: FrameDecoder,
    outbox: Vec<u8>,
    check_index: u8,
    next_check: Option<Instant>,
    check_interval: Duration,
    responsive: bool,
}

impl Default for VirtualController {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL)
    }
}

impl VirtualController {
    /// A controller in `Run` mode reporting every `check_interval` in check mode
    pub fn new(check_interval: Duration) -> Self {
        Self {
            mode: ControllerMode::Run,
            diodes: BTreeSet::new(),
            decoder: FrameDecoder::new(),
            outbox: Vec::new(),
            check_index: 1,
            next_check: None,
            check_interval,
            responsive: true,
        }
    }

    /// Current mode
    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    /// Diode table as programmed by the host
    pub fn diodes(&self) -> &BTreeSet<Pins> {
        &self.diodes
    }

    /// A controller that stops responding still accepts bytes but never answers
    pub fn set_responsive(&mut self, responsive: bool) {
        self.responsive = responsive;
    }

    /// Feed bytes written by the host
    pub fn receive(&mut self, bytes: &[u8], now: Instant) {
        self.decoder.extend(bytes);
        while let Some(frame) = self.decoder.next_frame() {
            self.handle_frame(frame, now);
        }
    }

    /// Run periodic work due at `now`
    pub fn tick(&mut self, now: Instant) {
        if self.mode != ControllerMode::CheckKeyboard || !self.responsive {
            return;
        }
        let due = match self.next_check {
            Some(at) => at <= now,
            None => true,
        };
        if !due {
            return;
        }

        let i = if (1..=MAX_PIN).contains(&self.check_index) {
            self.check_index
        } else {
            1
        };
        self.send_status(StatusPayload::new(Pins::new(i, i), Vec::new()));
        self.check_index = 1 + (i % MAX_PIN);
        self.next_check = Some(now + self.check_interval);
    }

    /// Bytes the controller has queued for the host
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbox)
    }

    /// Drop partial input, as after a power cycle
    pub fn reset_input(&mut self) {
        self.decoder.clear();
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let command = match frame.command() {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!("Virtual controller ignoring frame: {}", e);
                return;
            }
        };
        if !self.responsive {
            tracing::trace!("Virtual controller silent, dropping {}", command);
            return;
        }

        let pins = match frame.payload.as_slice() {
            [pin1, pin2, ..] => Pins::new(*pin1, *pin2),
            _ => Pins::default(),
        };

        match command {
            Command::Echo => self.reply(&frame),
            Command::ModeRun => self.enter(ControllerMode::Run, now),
            Command::ModeCheckKeyboard => self.enter(ControllerMode::CheckKeyboard, now),
            Command::ModeConfigure => self.enter(ControllerMode::Configure, now),
            Command::ModeDiodeConfig => {
                self.diodes.insert(pins);
                self.enter(ControllerMode::DiodeConfig, now);
                self.reply(&frame);
            }
            Command::ModeDiodeConfigDel => {
                self.diodes.remove(&pins);
                self.enter(ControllerMode::DiodeConfig, now);
                self.reply(&frame);
            }
            Command::ModeDiodeClear => {
                self.diodes.clear();
                self.enter(ControllerMode::DiodeConfig, now);
                self.reply(&frame);
            }
            Command::ButtonPressed
                if matches!(self.mode, ControllerMode::Run | ControllerMode::CheckKeyboard) =>
            {
                if (1..=MAX_PIN).contains(&pins.pin1) && (1..=MAX_PIN).contains(&pins.pin2) {
                    self.send_status(StatusPayload::new(pins, vec![pins]));
                } else {
                    tracing::debug!("Virtual controller: press out of range {}", pins);
                }
            }
            other => tracing::debug!("Virtual controller ignoring {} in {:?}", other, self.mode),
        }
    }

    fn enter(&mut self, mode: ControllerMode, now: Instant) {
        if self.mode != mode {
            tracing::debug!("Virtual controller mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
        if mode == ControllerMode::CheckKeyboard {
            self.check_index = 1;
            self.next_check = Some(now);
        } else {
            self.next_check = None;
        }
    }

    fn reply(&mut self, frame: &Frame) {
        match frame.to_bytes() {
            Ok(bytes) => self.outbox.extend(bytes),
            Err(e) => tracing::debug!("Virtual controller cannot echo frame: {}", e),
        }
    }

    fn send_status(&mut self, status: StatusPayload) {
        match status
            .to_payload()
            .and_then(|payload| encode(Command::StatusUpdate, &payload))
        {
            Ok(bytes) => self.outbox.extend(bytes),
            Err(e) => tracing::debug!("Virtual controller cannot encode status: {}", e),
        }
    }
}

#[derive(Debug)]
struct EmulatorState {
    controller: VirtualController,
    device_port: String,
    silent_ports: Vec<String>,
    plugged: bool,
    open_port: Option<String>,
    written: Vec<(String, Vec<u8>)>,
}

/// Shared handle to an emulated serial bus with one controller on it.
///
/// The bus has the controller's port plus any number of silent ports that
/// open fine but never answer.
#[derive(Debug, Clone)]
pub struct EmulatorHandle {
    state: Arc<Mutex<EmulatorState>>,
    clock: fn() -> Instant,
}

impl EmulatorHandle {
    /// Bus with the controller on `device_port`, timed by the system clock
    pub fn new(device_port: impl Into<String>) -> Self {
        Self::with_clock(device_port, Instant::now)
    }

    /// Use `clock` for check-mode timing instead of the system clock
    pub fn with_clock(device_port: impl Into<String>, clock: fn() -> Instant) -> Self {
        Self {
            state: Arc::new(Mutex::new(EmulatorState {
                controller: VirtualController::default(),
                device_port: device_port.into(),
                silent_ports: Vec::new(),
                plugged: true,
                open_port: None,
                written: Vec::new(),
            })),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a port that opens but never answers
    pub fn add_silent_port(&self, name: impl Into<String>) {
        self.lock().silent_ports.push(name.into());
    }

    /// Port the controller is attached to
    pub fn device_port(&self) -> String {
        self.lock().device_port.clone()
    }

    /// Remove the controller from the bus; an open link starts failing
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.plugged = false;
        state.controller.reset_input();
    }

    /// Put the controller back on the bus
    pub fn plug(&self) {
        self.lock().plugged = true;
    }

    /// See [`VirtualController::set_responsive`]
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().controller.set_responsive(responsive);
    }

    /// Controller's current mode
    pub fn mode(&self) -> ControllerMode {
        self.lock().controller.mode()
    }

    /// Controller's diode table in pin order
    pub fn diodes(&self) -> Vec<Pins> {
        self.lock().controller.diodes().iter().copied().collect()
    }

    /// Every frame written by the host, with the port it went to
    pub fn written(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().written.clone()
    }

    /// Commands the controller itself received, in order
    pub fn received_commands(&self) -> Vec<Command> {
        let state = self.lock();
        let mut decoder = FrameDecoder::new();
        state
            .written
            .iter()
            .filter(|(port, _)| *port == state.device_port)
            .flat_map(|(_, bytes)| {
                decoder.extend(bytes);
                decoder.drain_frames()
            })
            .filter_map(|frame| frame.command().ok())
            .collect()
    }

    /// New transport onto this bus
    pub fn transport(&self) -> EmulatedTransport {
        EmulatedTransport {
            handle: self.clone(),
        }
    }

    /// Lister reporting this bus's ports
    pub fn lister(&self) -> EmulatedPortLister {
        EmulatedPortLister {
            handle: self.clone(),
        }
    }
}

/// [`Transport`] end of an [`EmulatorHandle`]
#[derive(Debug, Clone)]
pub struct EmulatedTransport {
    handle: EmulatorHandle,
}

impl EmulatedTransport {
    fn device_gone(port: &str) -> ProtocolError {
        ProtocolError::SerialError(format!("device on {} disconnected", port))
    }
}

impl Transport for EmulatedTransport {
    fn open(&mut self, port_name: &str) -> Result<(), ProtocolError> {
        let mut state = self.handle.lock();
        let is_device = port_name == state.device_port && state.plugged;
        if !is_device && !state.silent_ports.iter().any(|p| p == port_name) {
            state.open_port = None;
            return Err(ProtocolError::SerialError(format!(
                "no such port: {}",
                port_name
            )));
        }
        if is_device {
            state.controller.reset_input();
        }
        state.open_port = Some(port_name.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.handle.lock().open_port = None;
    }

    fn is_open(&self) -> bool {
        self.handle.lock().open_port.is_some()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let now = (self.handle.clock)();
        let mut state = self.handle.lock();
        let port = state.open_port.clone().ok_or(ProtocolError::NotOpen)?;
        if port == state.device_port {
            if !state.plugged {
                return Err(Self::device_gone(&port));
            }
            state.controller.receive(bytes, now);
        }
        state.written.push((port, bytes.to_vec()));
        Ok(())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        let now = (self.handle.clock)();
        let mut state = self.handle.lock();
        let port = state.open_port.clone().ok_or(ProtocolError::NotOpen)?;
        if port != state.device_port {
            return Ok(0);
        }
        if !state.plugged {
            return Err(Self::device_gone(&port));
        }

        state.controller.tick(now);
        let output = state.controller.take_output();
        buf.extend_from_slice(&output);
        Ok(output.len())
    }
}

/// [`PortLister`] end of an [`EmulatorHandle`]
#[derive(Debug, Clone)]
pub struct EmulatedPortLister {
    handle: EmulatorHandle,
}

impl PortLister for EmulatedPortLister {
    fn port_names(&self) -> Vec<String> {
        let state = self.handle.lock();
        let mut names = state.silent_ports.clone();
        if state.plugged {
            names.push(state.device_port.clone());
        }
        names
    }
}
