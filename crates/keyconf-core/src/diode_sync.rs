//! Diode configuration sync
//!
//! Mirrors the set of configured LED pin pairs onto the controller. The
//! controller forgets its diode table when it resets, so every new connection
//! starts with a full replay: `ModeDiodeClear` followed by one
//! `ModeDiodeConfig` per diode. While connected, single changes are forwarded
//! as they happen.
//!
//! The service does not own the link; each operation returns the commands to
//! send, in order.

use std::collections::BTreeSet;

use crate::protocol::{Command, LinkEvent, OutgoingCommand, Pins};

/// Diode table mirror for one controller
#[derive(Debug, Clone, Default)]
pub struct DiodeSync {
    diodes: BTreeSet<Pins>,
    connected: bool,
    full_sync_required: bool,
}

impl DiodeSync {
    /// Empty set, disconnected
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole diode set
    pub fn reset(&mut self, diodes: impl IntoIterator<Item = Pins>) -> Vec<OutgoingCommand> {
        self.diodes = diodes.into_iter().collect();
        self.full_sync_required = true;
        self.full_state()
    }

    /// Add a diode. Sent at once when connected and in sync.
    pub fn upsert(&mut self, pins: Pins) -> Vec<OutgoingCommand> {
        self.diodes.insert(pins);
        if self.connected && !self.full_sync_required {
            vec![OutgoingCommand::with_pins(Command::ModeDiodeConfig, pins)]
        } else {
            Vec::new()
        }
    }

    /// Remove a diode. Sent at once when connected and in sync.
    pub fn remove(&mut self, pins: Pins) -> Vec<OutgoingCommand> {
        self.diodes.remove(&pins);
        if self.connected && !self.full_sync_required {
            vec![OutgoingCommand::with_pins(Command::ModeDiodeConfigDel, pins)]
        } else {
            Vec::new()
        }
    }

    /// Mark the link up and return the full replay
    pub fn connection_established(&mut self) -> Vec<OutgoingCommand> {
        self.connected = true;
        self.full_sync_required = true;
        self.full_state()
    }

    /// Mark the link down; the next connection replays everything
    pub fn connection_lost(&mut self) {
        self.connected = false;
        self.full_sync_required = true;
    }

    /// Feed a link event; returns commands to send for `Connected`
    pub fn handle_event(&mut self, event: &LinkEvent) -> Vec<OutgoingCommand> {
        match event {
            LinkEvent::Connected { .. } => self.connection_established(),
            LinkEvent::Disconnected => {
                self.connection_lost();
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Configured diodes in pin order
    pub fn diodes(&self) -> impl Iterator<Item = &Pins> {
        self.diodes.iter()
    }

    /// Whether a connection is currently tracked
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn full_state(&mut self) -> Vec<OutgoingCommand> {
        if !self.connected || !self.full_sync_required {
            return Vec::new();
        }

        tracing::debug!("Replaying {} diodes to the controller", self.diodes.len());
        let mut commands = Vec::with_capacity(self.diodes.len() + 1);
        commands.push(OutgoingCommand::new(Command::ModeDiodeClear));
        commands.extend(
            self.diodes
                .iter()
                .map(|pins| OutgoingCommand::with_pins(Command::ModeDiodeConfig, *pins)),
        );
        self.full_sync_required = false;
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(p1: u8, p2: u8) -> OutgoingCommand {
        OutgoingCommand::with_pins(Command::ModeDiodeConfig, Pins::new(p1, p2))
    }

    #[test]
    fn test_nothing_sent_while_disconnected() {
        let mut sync = DiodeSync::new();
        assert!(sync.reset([Pins::new(1, 2)]).is_empty());
        assert!(sync.upsert(Pins::new(3, 4)).is_empty());
        assert!(sync.remove(Pins::new(1, 2)).is_empty());
        assert_eq!(sync.diodes().count(), 1);
    }

    #[test]
    fn test_full_replay_on_connect() {
        let mut sync = DiodeSync::new();
        sync.reset([Pins::new(5, 6), Pins::new(1, 2)]);
        sync.upsert(Pins::new(3, 4));

        let commands = sync.handle_event(&LinkEvent::Connected {
            port_name: "COM5".into(),
        });
        assert_eq!(
            commands,
            vec![
                OutgoingCommand::new(Command::ModeDiodeClear),
                config(1, 2),
                config(3, 4),
                config(5, 6),
            ]
        );
    }

    #[test]
    fn test_incremental_while_connected() {
        let mut sync = DiodeSync::new();
        sync.connection_established();

        assert_eq!(sync.upsert(Pins::new(7, 8)), vec![config(7, 8)]);
        assert_eq!(
            sync.remove(Pins::new(7, 8)),
            vec![OutgoingCommand::with_pins(
                Command::ModeDiodeConfigDel,
                Pins::new(7, 8)
            )]
        );
    }

    #[test]
    fn test_reset_while_connected_replays() {
        let mut sync = DiodeSync::new();
        sync.connection_established();
        let commands = sync.reset([Pins::new(2, 2)]);
        assert_eq!(
            commands,
            vec![OutgoingCommand::new(Command::ModeDiodeClear), config(2, 2)]
        );
    }

    #[test]
    fn test_reconnect_replays_again() {
        let mut sync = DiodeSync::new();
        sync.reset([Pins::new(1, 1)]);
        sync.connection_established();
        sync.handle_event(&LinkEvent::Disconnected);
        assert!(!sync.is_connected());

        // Changes while offline are only stored
        assert!(sync.upsert(Pins::new(4, 4)).is_empty());

        let commands = sync.connection_established();
        assert_eq!(
            commands,
            vec![
                OutgoingCommand::new(Command::ModeDiodeClear),
                config(1, 1),
                config(4, 4),
            ]
        );
    }
}
