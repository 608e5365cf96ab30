//! Outbound command queue
//!
//! Commands are encoded when enqueued and written strictly in FIFO order. A
//! command that requires acknowledgment blocks the queue until the controller
//! echoes its opcode or the ack timeout expires; an expired ack is not retried.
//! Between commands an optional pacing delay gives the controller time to
//! process the previous frame.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::packet::encode_command;
use super::timer::{earliest, Deadline};
use super::{Command, Pins, ProtocolError, Transport};

/// An encoded command waiting for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    /// Command being sent
    pub command: Command,
    /// Complete encoded frame
    pub bytes: Vec<u8>,
}

impl QueuedCommand {
    /// Encode `command` now
    pub fn new(command: Command, pins: Option<Pins>) -> Self {
        Self {
            command,
            bytes: encode_command(command, pins),
        }
    }
}

/// FIFO of outbound commands with ack tracking and pacing
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<QueuedCommand>,
    awaiting_ack: Option<Command>,
    ack_timeout: Deadline,
    pacing: Deadline,
    ack_timeout_duration: Duration,
    inter_command_delay: Duration,
}

impl CommandQueue {
    /// Empty queue with the given ack timeout and pacing delay
    pub fn new(ack_timeout: Duration, inter_command_delay: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            awaiting_ack: None,
            ack_timeout: Deadline::idle(),
            pacing: Deadline::idle(),
            ack_timeout_duration: ack_timeout,
            inter_command_delay,
        }
    }

    /// Encode and append a command, then try to send
    pub fn enqueue<T: Transport + ?Sized>(
        &mut self,
        command: Command,
        pins: Option<Pins>,
        now: Instant,
        transport: &mut T,
    ) -> Result<(), ProtocolError> {
        self.pending.push_back(QueuedCommand::new(command, pins));
        self.drain_step(now, transport)
    }

    /// Send queued commands until one needs an ack, the pacing delay starts,
    /// or the queue is empty.
    ///
    /// Does nothing while the transport is closed, an ack is pending, or the
    /// pacing delay is running. A write error drops the command being written
    /// and is returned once the step is over; the commands behind it keep
    /// draining on the same schedule as after a successful unacked write.
    pub fn drain_step<T: Transport + ?Sized>(
        &mut self,
        now: Instant,
        transport: &mut T,
    ) -> Result<(), ProtocolError> {
        if !transport.is_open() || self.awaiting_ack.is_some() || self.pacing.is_active() {
            return Ok(());
        }

        let mut first_error = None;
        while let Some(queued) = self.pending.pop_front() {
            tracing::debug!(
                "Sending {} ({} bytes): {:02x?}",
                queued.command,
                queued.bytes.len(),
                queued.bytes
            );

            match transport.write_all(&queued.bytes) {
                Ok(()) if queued.command.requires_ack() => {
                    self.awaiting_ack = Some(queued.command);
                    self.ack_timeout.start(now, self.ack_timeout_duration);
                    break;
                }
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!("Dropping {} after write error: {}", queued.command, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    if !transport.is_open() {
                        break;
                    }
                }
            }

            if !self.inter_command_delay.is_zero() {
                self.pacing.start(now, self.inter_command_delay);
                break;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handle an inbound opcode. Returns true if it acknowledged the command in flight.
    pub fn acknowledge<T: Transport + ?Sized>(
        &mut self,
        command: Command,
        now: Instant,
        transport: &mut T,
    ) -> Result<bool, ProtocolError> {
        if self.awaiting_ack != Some(command) {
            return Ok(false);
        }

        tracing::debug!("Ack received for {}", command);
        self.awaiting_ack = None;
        self.ack_timeout.cancel();
        self.resume(now, transport)?;
        Ok(true)
    }

    /// Fire expired timers
    pub fn handle_timers<T: Transport + ?Sized>(
        &mut self,
        now: Instant,
        transport: &mut T,
    ) -> Result<(), ProtocolError> {
        if self.ack_timeout.fire(now) {
            if let Some(command) = self.awaiting_ack.take() {
                tracing::warn!("Ack timeout for command {}", command);
                self.resume(now, transport)?;
            }
        }

        if self.pacing.fire(now) {
            self.drain_step(now, transport)?;
        }

        Ok(())
    }

    fn resume<T: Transport + ?Sized>(
        &mut self,
        now: Instant,
        transport: &mut T,
    ) -> Result<(), ProtocolError> {
        if self.inter_command_delay.is_zero() {
            self.drain_step(now, transport)
        } else {
            self.pacing.start(now, self.inter_command_delay);
            Ok(())
        }
    }

    /// Drop every queued command and cancel both timers
    pub fn clear(&mut self) {
        self.pending.clear();
        self.awaiting_ack = None;
        self.ack_timeout.cancel();
        self.pacing.cancel();
    }

    /// Command in flight waiting for its ack
    pub fn awaiting_ack(&self) -> Option<Command> {
        self.awaiting_ack
    }

    /// Commands not yet written
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is left to write
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When [`handle_timers`](Self::handle_timers) next has work
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.ack_timeout.at(), self.pacing.at()])
    }
}
