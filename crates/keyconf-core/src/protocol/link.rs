//! Device link
//!
//! Owns the transport, the receive buffer and the outbound command queue.
//! Inbound frames are decoded here and turned into [`LinkEvent`]s; acks are
//! routed to the queue before the event is published.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::packet::FrameDecoder;
use super::queue::CommandQueue;
use super::{Command, Frame, LinkEvent, Pins, ProtocolError, StatusPayload, Transport};

/// A transport plus framing, dispatch and the outbound queue
pub struct DeviceLink<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    queue: CommandQueue,
    read_buf: Vec<u8>,
    events: VecDeque<LinkEvent>,
    port_name: Option<String>,
    /// Set after a read error until the next successful read or reopen
    input_failed: bool,
}

impl<T: Transport> DeviceLink<T> {
    /// Closed link over `transport`
    pub fn new(transport: T, ack_timeout: Duration, inter_command_delay: Duration) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
            queue: CommandQueue::new(ack_timeout, inter_command_delay),
            read_buf: Vec::with_capacity(256),
            events: VecDeque::new(),
            port_name: None,
            input_failed: false,
        }
    }

    /// Open `port_name`, closing any port that is already open.
    /// Queued commands start draining once the port is open.
    pub fn open_port(&mut self, port_name: &str, now: Instant) -> bool {
        if self.transport.is_open() {
            self.close_port();
        }

        tracing::info!("Opening serial port {}", port_name);
        match self.transport.open(port_name) {
            Ok(()) => {
                tracing::info!("Port {} opened successfully", port_name);
                self.port_name = Some(port_name.to_string());
                self.input_failed = false;
                let result = self.queue.drain_step(now, &mut self.transport);
                self.report(result);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to open port {}: {}", port_name, e);
                false
            }
        }
    }

    /// Close the port and drop every queued command
    pub fn close_port(&mut self) {
        if self.transport.is_open() {
            tracing::info!(
                "Closing serial port {}",
                self.port_name.as_deref().unwrap_or("?")
            );
            self.transport.close();
            self.queue.clear();
        }
        self.port_name = None;
    }

    /// Discard pending input, including any partially received frame
    pub fn clear_buffer(&mut self) {
        if self.transport.is_open() {
            self.read_buf.clear();
            if let Err(e) = self.transport.read_available(&mut self.read_buf) {
                tracing::debug!("Failed to flush input: {}", e);
            }
            self.read_buf.clear();
        }
        self.decoder.clear();
    }

    /// Queue a command for transmission
    pub fn send_command(&mut self, command: Command, pins: Option<Pins>, now: Instant) {
        let result = self.queue.enqueue(command, pins, now, &mut self.transport);
        self.report(result);
    }

    /// Read available input and dispatch every complete frame
    pub fn poll_input(&mut self, now: Instant) {
        if !self.transport.is_open() {
            return;
        }

        self.read_buf.clear();
        match self.transport.read_available(&mut self.read_buf) {
            Ok(0) => {
                self.input_failed = false;
                return;
            }
            Ok(n) => {
                self.input_failed = false;
                tracing::trace!("Read {} bytes: {:02x?}", n, self.read_buf);
            }
            Err(e) if self.input_failed => {
                tracing::trace!("Read still failing: {}", e);
                return;
            }
            Err(e) => {
                self.input_failed = true;
                self.report(Err(e));
                return;
            }
        }
        self.decoder.extend(&self.read_buf);

        while let Some(frame) = self.decoder.next_frame() {
            self.dispatch(frame, now);
        }
    }

    fn dispatch(&mut self, frame: Frame, now: Instant) {
        let command = match frame.command() {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!("Ignoring frame: {}", e);
                return;
            }
        };

        match command {
            Command::Echo => {
                self.acknowledge(Command::Echo, now);
                self.events.push_back(LinkEvent::EchoReceived);
            }
            Command::StatusUpdate => match StatusPayload::from_frame(&frame) {
                Ok(status) => self.events.push_back(LinkEvent::StatusReceived(status)),
                Err(e) => tracing::debug!("Dropping status frame: {}", e),
            },
            other => {
                self.acknowledge(other, now);
                self.events.push_back(LinkEvent::ReceivedCommand(other));
            }
        }
    }

    fn acknowledge(&mut self, command: Command, now: Instant) {
        let result = self
            .queue
            .acknowledge(command, now, &mut self.transport)
            .map(|_| ());
        self.report(result);
    }

    /// Fire expired queue timers
    pub fn handle_timers(&mut self, now: Instant) {
        let result = self.queue.handle_timers(now, &mut self.transport);
        self.report(result);
    }

    fn report(&mut self, result: Result<(), ProtocolError>) {
        if let Err(e) = result {
            tracing::error!("Serial port error: {}", e);
            self.events.push_back(LinkEvent::PortError(e.to_string()));
        }
    }

    /// Next pending event
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// When [`handle_timers`](Self::handle_timers) next has work
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    /// Whether the transport is open
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Name of the open port
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Outbound queue
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Drop for DeviceLink<T> {
    fn drop(&mut self) {
        self.close_port();
    }
}
