//! Connection management
//!
//! Discovers the controller among the available serial ports, verifies it with
//! an echo handshake, keeps it alive with a heartbeat and reconnects when it
//! goes silent.
//!
//! ```text
//!                start_auto_connect()
//!  Disconnected ──────────────────────► Probing ──echo──► Connected
//!       ▲  ▲   no candidates / exhausted   │                  │
//!       │  └───────────────────────────────┘                  │
//!       │             heartbeat echo timeout (restarts probing)│
//!       └──────────────────────────────────────────────────────┘
//! ```
//!
//! While disconnected with auto-connect enabled, the manager polls the port
//! list and restarts probing as soon as a new candidate port shows up.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::link::DeviceLink;
use super::timer::{earliest, Deadline};
use super::{
    Command, LinkEvent, Pins, PortLister, ProtocolError, Transport, DEFAULT_ACK_TIMEOUT_MS,
    DEFAULT_BAUD_RATE, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_INTER_COMMAND_DELAY_MS,
    DEFAULT_PORT_POLL_INTERVAL_MS, DEFAULT_READ_POLL_INTERVAL_MS, DEFAULT_RESPONSE_TIMEOUT_MS,
};

/// Connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No port open
    Disconnected,
    /// Trying `candidates[index]`
    Probing {
        /// Ports to try, in order
        candidates: Vec<String>,
        /// Port currently waiting for an echo
        index: usize,
    },
    /// Echo handshake succeeded
    Connected {
        /// Port the controller answered on
        port_name: String,
    },
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Port base-name prefixes considered during auto-connect
    pub port_patterns: Vec<String>,
    /// Extra port always probed last (e.g. a virtual tty pair)
    pub test_port: Option<String>,
    /// How long an ack-requiring command may block the queue
    pub ack_timeout_ms: u64,
    /// Pacing delay between commands; 0 sends back to back
    pub inter_command_delay_ms: u64,
    /// How long to wait for an echo reply
    pub response_timeout_ms: u64,
    /// Echo period while connected
    pub heartbeat_interval_ms: u64,
    /// Hot-plug poll period while disconnected
    pub port_poll_interval_ms: u64,
    /// Transport read poll period used by the runtime
    pub read_poll_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            port_patterns: vec!["COM".into(), "ttyUSB".into(), "ttyACM".into()],
            test_port: None,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            inter_command_delay_ms: DEFAULT_INTER_COMMAND_DELAY_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            port_poll_interval_ms: DEFAULT_PORT_POLL_INTERVAL_MS,
            read_poll_interval_ms: DEFAULT_READ_POLL_INTERVAL_MS,
        }
    }
}

impl ConnectionConfig {
    /// Load a JSON configuration; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: ConnectionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// `<config dir>/keyconf/link.json`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("keyconf").join("link.json"))
    }

    /// Reject a zero baud rate and zero timeouts or intervals
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::Config("baud_rate must be non-zero".into()));
        }
        for (name, value) in [
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("port_poll_interval_ms", self.port_poll_interval_ms),
            ("read_poll_interval_ms", self.read_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ProtocolError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    /// Ack timeout as a `Duration`
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Pacing delay as a `Duration`
    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    /// Echo reply timeout as a `Duration`
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Heartbeat period as a `Duration`
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Hot-plug poll period as a `Duration`
    pub fn port_poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms)
    }

    /// Read poll period as a `Duration`
    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }

    /// Whether a port name matches one of the auto-connect patterns.
    /// Only the base name is compared, so `/dev/ttyUSB0` matches `ttyUSB`.
    pub fn is_candidate(&self, port_name: &str) -> bool {
        let basename = port_name.rsplit(['/', '\\']).next().unwrap_or(port_name);
        self.port_patterns
            .iter()
            .any(|pattern| basename.starts_with(pattern.as_str()))
    }
}

/// Auto-connecting owner of the device link
pub struct ConnectionManager<T: Transport, L: PortLister> {
    link: DeviceLink<T>,
    lister: L,
    config: ConnectionConfig,
    state: ConnectionState,
    /// Set between start_auto_connect() and stop_auto_connect()
    auto_connect: bool,
    waiting_echo: bool,
    heartbeat_interval: Duration,
    heartbeat: Deadline,
    response: Deadline,
    port_monitor: Deadline,
    last_observed: BTreeSet<String>,
    last_port: Option<String>,
    events: VecDeque<LinkEvent>,
}

impl<T: Transport, L: PortLister> ConnectionManager<T, L> {
    /// Idle manager; nothing happens until [`start_auto_connect`](Self::start_auto_connect)
    pub fn new(transport: T, lister: L, config: ConnectionConfig) -> Self {
        let link = DeviceLink::new(
            transport,
            config.ack_timeout(),
            config.inter_command_delay(),
        );
        Self {
            link,
            lister,
            heartbeat_interval: config.heartbeat_interval(),
            config,
            state: ConnectionState::Disconnected,
            auto_connect: false,
            waiting_echo: false,
            heartbeat: Deadline::idle(),
            response: Deadline::idle(),
            port_monitor: Deadline::idle(),
            last_observed: BTreeSet::new(),
            last_port: None,
            events: VecDeque::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Whether the handshake has completed on some port
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    /// Port of the live connection, if any
    pub fn current_port_name(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Connected { port_name } => Some(port_name),
            _ => None,
        }
    }

    /// Port of the most recent successful connection, kept across stop/start
    pub fn last_port_name(&self) -> Option<&str> {
        self.last_port.as_deref()
    }

    /// Configuration in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The underlying device link
    pub fn link(&self) -> &DeviceLink<T> {
        &self.link
    }

    /// Direct access to the link for manual port selection
    pub fn link_mut(&mut self) -> &mut DeviceLink<T> {
        &mut self.link
    }

    /// Begin probing candidate ports. Ignored unless disconnected.
    pub fn start_auto_connect(&mut self, now: Instant) {
        if self.state != ConnectionState::Disconnected {
            tracing::warn!("Auto-connect requested but manager is not disconnected");
            return;
        }

        tracing::info!("Starting auto-connect probing");
        self.auto_connect = true;
        self.probe_ports(now);
    }

    /// Cancel every timer, close the port and stay disconnected
    pub fn stop_auto_connect(&mut self) {
        self.heartbeat.cancel();
        self.response.cancel();
        self.port_monitor.cancel();
        self.waiting_echo = false;
        self.auto_connect = false;
        self.link.close_port();
        self.state = ConnectionState::Disconnected;
        tracing::info!("Auto-connect stopped");
        self.events.push_back(LinkEvent::Disconnected);
    }

    /// Queue a command if connected. Returns false otherwise.
    pub fn send_command(&mut self, command: Command, pins: Option<Pins>, now: Instant) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.link.send_command(command, pins, now);
        self.process_link_events(now);
        true
    }

    /// Change the heartbeat period, restarting a running heartbeat
    pub fn set_heartbeat_interval(&mut self, interval: Duration, now: Instant) {
        self.heartbeat_interval = interval;
        if self.heartbeat.is_active() {
            self.heartbeat.start(now, interval);
        }
    }

    /// Process available input and every expired deadline
    pub fn poll(&mut self, now: Instant) {
        self.link.poll_input(now);
        self.process_link_events(now);

        self.link.handle_timers(now);
        self.process_link_events(now);

        if self.response.fire(now) {
            self.on_response_timeout(now);
        }
        if self.heartbeat.fire(now) {
            self.on_heartbeat(now);
        }
        if self.port_monitor.fire(now) {
            self.on_port_monitor(now);
        }
        self.process_link_events(now);
    }

    /// Earliest instant at which [`poll`](Self::poll) has timer work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.link.next_deadline(),
            self.response.at(),
            self.heartbeat.at(),
            self.port_monitor.at(),
        ])
    }

    /// Next pending event
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Every pending event, oldest first
    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        self.events.drain(..).collect()
    }

    /// Enumerated ports that match the naming patterns, in lister order
    fn candidate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.lister.port_names() {
            if self.config.is_candidate(&name) && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn probe_ports(&mut self, now: Instant) {
        let mut candidates = self.candidate_names();
        self.last_observed = candidates.iter().cloned().collect();

        if let Some(test_port) = &self.config.test_port {
            if !candidates.contains(test_port) {
                candidates.push(test_port.clone());
            }
        }

        tracing::info!("Probing {} serial ports", candidates.len());
        if candidates.is_empty() {
            tracing::warn!("No serial ports available");
            self.state = ConnectionState::Disconnected;
            self.events
                .push_back(LinkEvent::ConnectionError("no serial ports available".into()));
            self.update_port_monitor(now);
            return;
        }

        self.state = ConnectionState::Probing {
            candidates,
            index: 0,
        };
        self.update_port_monitor(now);
        self.try_candidates(now);
    }

    /// Open candidates from the current index until one opens or none are left
    fn try_candidates(&mut self, now: Instant) {
        loop {
            let port = match &self.state {
                ConnectionState::Probing { candidates, index } => candidates.get(*index).cloned(),
                _ => return,
            };

            let Some(port) = port else {
                self.probing_exhausted(now);
                return;
            };

            tracing::info!("Testing serial port {}", port);
            if self.link.open_port(&port, now) {
                self.waiting_echo = true;
                self.link.clear_buffer();
                self.link.send_command(Command::Echo, None, now);
                self.response.start(now, self.config.response_timeout());
                return;
            }

            tracing::warn!("Failed to open serial port {}, trying next", port);
            self.advance_candidate();
        }
    }

    fn advance_candidate(&mut self) {
        if let ConnectionState::Probing { index, .. } = &mut self.state {
            *index += 1;
        }
    }

    fn probe_next(&mut self, now: Instant) {
        self.response.cancel();
        self.waiting_echo = false;
        self.link.close_port();
        self.advance_candidate();
        self.try_candidates(now);
    }

    fn probing_exhausted(&mut self, now: Instant) {
        tracing::error!("Device not found on available serial ports");
        self.state = ConnectionState::Disconnected;
        self.events.push_back(LinkEvent::ConnectionError(
            "device not found on available serial ports".into(),
        ));
        self.events.push_back(LinkEvent::Disconnected);
        self.update_port_monitor(now);
    }

    fn on_echo(&mut self, now: Instant) {
        if !self.waiting_echo {
            return;
        }
        self.waiting_echo = false;
        self.response.cancel();

        let port_name = match &self.state {
            ConnectionState::Probing { candidates, index } => candidates.get(*index).cloned(),
            _ => None,
        };
        if let Some(port_name) = port_name {
            self.connect_success(port_name, now);
        }
    }

    fn connect_success(&mut self, port_name: String, now: Instant) {
        tracing::info!("Connected on port {}", port_name);
        self.last_port = Some(port_name.clone());
        self.state = ConnectionState::Connected {
            port_name: port_name.clone(),
        };
        self.events.push_back(LinkEvent::Connected { port_name });
        self.heartbeat.start(now, self.heartbeat_interval);
        self.update_port_monitor(now);
    }

    fn on_heartbeat(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        self.heartbeat.start(now, self.heartbeat_interval);

        if self.waiting_echo {
            return;
        }

        tracing::debug!("Sending heartbeat echo");
        self.waiting_echo = true;
        self.link.send_command(Command::Echo, None, now);
        self.response.start(now, self.config.response_timeout());
    }

    fn on_response_timeout(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Probing { .. } => {
                tracing::warn!("Response timeout while probing");
                self.probe_next(now);
            }
            ConnectionState::Connected { .. } => {
                tracing::warn!("Response timeout while connected, restarting auto-connect");
                self.handle_disconnect(now);
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// Drop a lost connection and start probing again
    fn handle_disconnect(&mut self, now: Instant) {
        self.heartbeat.cancel();
        self.response.cancel();
        self.waiting_echo = false;

        if let ConnectionState::Connected { port_name } = &self.state {
            tracing::info!("Disconnected from port {}", port_name);
            self.events.push_back(LinkEvent::Disconnected);
        }

        self.state = ConnectionState::Disconnected;
        self.link.close_port();

        tracing::info!("Restarting auto-connect after disconnect");
        self.start_auto_connect(now);
    }

    /// Run the hot-plug poll only while disconnected with auto-connect enabled
    fn update_port_monitor(&mut self, now: Instant) {
        let wanted = self.auto_connect && self.state == ConnectionState::Disconnected;
        if !wanted {
            self.port_monitor.cancel();
        } else if !self.port_monitor.is_active() {
            self.port_monitor.start(now, self.config.port_poll_interval());
        }
    }

    fn on_port_monitor(&mut self, now: Instant) {
        if !self.auto_connect || self.state != ConnectionState::Disconnected {
            return;
        }

        let current: BTreeSet<String> = self.candidate_names().into_iter().collect();
        let appeared: Vec<&String> = current.difference(&self.last_observed).collect();

        if appeared.is_empty() {
            self.last_observed = current;
            self.port_monitor
                .start(now, self.config.port_poll_interval());
            return;
        }

        tracing::info!("New serial port detected: {:?}", appeared);
        self.last_observed = current;
        self.start_auto_connect(now);
    }

    fn process_link_events(&mut self, now: Instant) {
        while let Some(event) = self.link.poll_event() {
            match event {
                LinkEvent::EchoReceived => {
                    self.events.push_back(LinkEvent::EchoReceived);
                    self.on_echo(now);
                }
                LinkEvent::PortError(description) => {
                    self.events
                        .push_back(LinkEvent::PortError(description.clone()));
                    self.events
                        .push_back(LinkEvent::ConnectionError(description));
                }
                other => self.events.push_back(other),
            }
        }
    }
}

impl<T: Transport, L: PortLister> Drop for ConnectionManager<T, L> {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        self.response.cancel();
        self.port_monitor.cancel();
        self.link.close_port();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{encode, encode_command};
    use crate::protocol::transport::mock::{MockLister, MockTransport};
    use pretty_assertions::assert_eq;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn echo() -> Vec<u8> {
        encode(Command::Echo, &[]).unwrap()
    }

    fn manager(
        ports: &[&str],
        openable: &[&str],
    ) -> (ConnectionManager<MockTransport, MockLister>, MockTransport) {
        let mock = MockTransport::with_openable(openable);
        mock.set_ports(ports);
        let manager = ConnectionManager::new(mock.clone(), mock.lister(), ConnectionConfig::default());
        (manager, mock)
    }

    fn count(events: &[LinkEvent], pred: impl Fn(&LinkEvent) -> bool) -> usize {
        events.iter().filter(|&e| pred(e)).count()
    }

    /// Connect on COM5 at `t0 + 10ms`
    fn connected() -> (ConnectionManager<MockTransport, MockLister>, MockTransport, Instant) {
        let (mut manager, mock) = manager(&["COM3", "COM5"], &["COM5"]);
        let t0 = Instant::now();
        manager.start_auto_connect(t0);
        mock.push_rx(&echo());
        manager.poll(t0 + ms(10));
        assert!(manager.is_connected());
        manager.drain_events();
        (manager, mock, t0 + ms(10))
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.ack_timeout(), ms(200));
        assert_eq!(config.response_timeout(), ms(1000));
        assert_eq!(config.heartbeat_interval(), ms(5000));
        assert_eq!(config.inter_command_delay(), ms(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_candidate_patterns() {
        let config = ConnectionConfig::default();
        assert!(config.is_candidate("COM3"));
        assert!(config.is_candidate("/dev/ttyUSB0"));
        assert!(config.is_candidate("/dev/ttyACM1"));
        assert!(!config.is_candidate("/dev/ttyS0"));
        assert!(!config.is_candidate("/dev/rfcomm0"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ConnectionConfig {
            response_timeout_ms: 0,
            ..ConnectionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));
    }

    #[test]
    fn test_probing_success() {
        let (mut manager, mock) = manager(&["COM3", "COM5"], &["COM5"]);
        let t0 = Instant::now();
        manager.start_auto_connect(t0);

        assert_eq!(
            manager.state(),
            &ConnectionState::Probing {
                candidates: vec!["COM3".into(), "COM5".into()],
                index: 1
            }
        );
        assert_eq!(mock.state.lock().unwrap().open_attempts, vec!["COM3", "COM5"]);
        assert_eq!(mock.written(), vec![encode_command(Command::Echo, None)]);

        mock.push_rx(&echo());
        manager.poll(t0 + ms(10));

        assert_eq!(
            manager.state(),
            &ConnectionState::Connected {
                port_name: "COM5".into()
            }
        );
        let events = manager.drain_events();
        assert_eq!(
            count(&events, |e| matches!(e, LinkEvent::Connected { .. })),
            1
        );
        assert!(events.contains(&LinkEvent::Connected {
            port_name: "COM5".into()
        }));
        assert_eq!(manager.current_port_name(), Some("COM5"));
    }

    #[test]
    fn test_probing_exhaustion() {
        let (mut manager, mock) = manager(&["COM3", "COM5"], &["COM5"]);
        let t0 = Instant::now();
        manager.start_auto_connect(t0);

        manager.poll(t0 + ms(999));
        assert!(matches!(manager.state(), ConnectionState::Probing { .. }));

        manager.poll(t0 + ms(1000));
        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        assert!(!mock.is_open());

        let events = manager.drain_events();
        assert_eq!(
            count(&events, |e| matches!(e, LinkEvent::ConnectionError(_))),
            1
        );
        assert_eq!(count(&events, |e| *e == LinkEvent::Disconnected), 1);
    }

    #[test]
    fn test_silent_port_then_live_port() {
        let (mut manager, mock) = manager(&["COM3", "COM5"], &["COM3", "COM5"]);
        let t0 = Instant::now();
        manager.start_auto_connect(t0);

        // COM3 opens but never answers
        manager.poll(t0 + ms(1000));
        assert_eq!(
            manager.state(),
            &ConnectionState::Probing {
                candidates: vec!["COM3".into(), "COM5".into()],
                index: 1
            }
        );

        mock.push_rx(&echo());
        manager.poll(t0 + ms(1010));
        assert_eq!(manager.current_port_name(), Some("COM5"));
    }

    #[test]
    fn test_heartbeat_keeps_connection() {
        let (mut manager, mock, t1) = connected();
        mock.clear_written();

        manager.poll(t1 + ms(5000));
        assert_eq!(mock.written(), vec![encode_command(Command::Echo, None)]);

        mock.push_rx(&echo());
        manager.poll(t1 + ms(5020));
        manager.poll(t1 + ms(7000));

        assert!(manager.is_connected());
        let events = manager.drain_events();
        assert_eq!(events, vec![LinkEvent::EchoReceived]);
    }

    #[test]
    fn test_liveness_loss_restarts_probing() {
        let (mut manager, _mock, t1) = connected();

        manager.poll(t1 + ms(5000));
        assert!(manager.is_connected());
        manager.poll(t1 + ms(6000));

        let events = manager.drain_events();
        assert_eq!(count(&events, |e| *e == LinkEvent::Disconnected), 1);
        assert_eq!(
            count(&events, |e| matches!(e, LinkEvent::ConnectionError(_))),
            0
        );
        assert_eq!(
            manager.state(),
            &ConnectionState::Probing {
                candidates: vec!["COM3".into(), "COM5".into()],
                index: 1
            }
        );
        assert_eq!(manager.last_port_name(), Some("COM5"));
    }

    #[test]
    fn test_no_candidates_then_hot_plug() {
        let (mut manager, mock) = manager(&["/dev/ttyS0"], &["/dev/ttyUSB0"]);
        let t0 = Instant::now();
        manager.start_auto_connect(t0);

        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        assert_eq!(
            manager.drain_events(),
            vec![LinkEvent::ConnectionError("no serial ports available".into())]
        );
        assert_eq!(manager.next_deadline(), Some(t0 + ms(2000)));

        // Nothing new yet
        manager.poll(t0 + ms(2000));
        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        assert_eq!(manager.next_deadline(), Some(t0 + ms(4000)));

        mock.set_ports(&["/dev/ttyS0", "/dev/ttyUSB0"]);
        manager.poll(t0 + ms(4000));
        assert_eq!(
            manager.state(),
            &ConnectionState::Probing {
                candidates: vec!["/dev/ttyUSB0".into()],
                index: 0
            }
        );
    }

    #[test]
    fn test_hot_plug_after_exhaustion() {
        let (mut manager, mock) = manager(&["COM3"], &["COM3", "COM9"]);
        let t0 = Instant::now();
        manager.start_auto_connect(t0);
        manager.poll(t0 + ms(1000));
        assert_eq!(manager.state(), &ConnectionState::Disconnected);

        mock.set_ports(&["COM3", "COM9"]);
        manager.poll(t0 + ms(3000));
        // COM3 is probed again first, stays silent, then COM9 answers
        assert!(matches!(manager.state(), ConnectionState::Probing { index: 0, .. }));
        manager.poll(t0 + ms(4000));
        mock.push_rx(&echo());
        manager.poll(t0 + ms(4010));
        assert_eq!(manager.current_port_name(), Some("COM9"));
    }

    #[test]
    fn test_stop_cancels_everything() {
        let (mut manager, mock, t1) = connected();
        manager.stop_auto_connect();

        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        assert!(!mock.is_open());
        assert_eq!(manager.next_deadline(), None);
        assert_eq!(manager.drain_events(), vec![LinkEvent::Disconnected]);

        // No hot-plug restart after an explicit stop
        mock.set_ports(&["COM3", "COM5", "COM8"]);
        manager.poll(t1 + ms(60_000));
        assert_eq!(manager.state(), &ConnectionState::Disconnected);

        // Restart probes the full list again
        manager.start_auto_connect(t1 + ms(60_000));
        assert!(matches!(manager.state(), ConnectionState::Probing { .. }));
        assert_eq!(manager.last_port_name(), Some("COM5"));
    }

    #[test]
    fn test_start_ignored_unless_disconnected() {
        let (mut manager, mock, t1) = connected();
        let attempts = mock.state.lock().unwrap().open_attempts.len();
        manager.start_auto_connect(t1);
        assert!(manager.is_connected());
        assert_eq!(mock.state.lock().unwrap().open_attempts.len(), attempts);
    }

    #[test]
    fn test_send_command_requires_connection() {
        let (mut manager, mock) = manager(&["COM5"], &["COM5"]);
        let t0 = Instant::now();
        assert!(!manager.send_command(Command::ModeRun, None, t0));

        manager.start_auto_connect(t0);
        mock.push_rx(&echo());
        manager.poll(t0 + ms(10));
        manager.poll(t0 + ms(20));
        mock.clear_written();

        assert!(manager.send_command(Command::ModeRun, None, t0 + ms(20)));
        assert_eq!(mock.written(), vec![encode_command(Command::ModeRun, None)]);
    }

    #[test]
    fn test_port_error_does_not_disconnect() {
        let (mut manager, mock, t1) = connected();
        mock.state.lock().unwrap().fail_reads = true;
        manager.poll(t1 + ms(1));

        assert!(manager.is_connected());
        let events = manager.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LinkEvent::PortError(_)));
        assert!(matches!(events[1], LinkEvent::ConnectionError(_)));
    }

    #[test]
    fn test_test_port_probed_last() {
        let mock = MockTransport::with_openable(&["/tmp/ttyV1"]);
        mock.set_ports(&["COM4"]);
        let config = ConnectionConfig {
            test_port: Some("/tmp/ttyV1".into()),
            ..ConnectionConfig::default()
        };
        let mut manager = ConnectionManager::new(mock.clone(), mock.lister(), config);
        manager.start_auto_connect(Instant::now());
        assert_eq!(
            manager.state(),
            &ConnectionState::Probing {
                candidates: vec!["COM4".into(), "/tmp/ttyV1".into()],
                index: 1
            }
        );
    }

    #[test]
    fn test_heartbeat_interval_change() {
        let (mut manager, mock, t1) = connected();
        manager.set_heartbeat_interval(ms(1000), t1);
        mock.clear_written();
        manager.poll(t1 + ms(1000));
        assert_eq!(mock.written(), vec![encode_command(Command::Echo, None)]);
    }
}
