//! Async link driver
//!
//! One tokio task owns the [`ConnectionManager`] and everything below it.
//! Callers talk to it through a cloneable [`LinkHandle`] and receive
//! [`LinkEvent`]s on an unbounded channel. The task also owns the
//! [`DiodeSync`] service and replays the diode table on every connection.
//! Diode table commands leave the controller in its diode configuration
//! state, so once one is acknowledged the last requested work mode is sent
//! again.
//!
//! The loop reads the clock through `tokio::time::Instant`, so tests running
//! under a paused clock are deterministic.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::diode_sync::DiodeSync;
use crate::protocol::{
    Command, ConnectionManager, LinkEvent, OutgoingCommand, Pins, PortLister, ProtocolError,
    Transport, WorkMode,
};

/// Request channel capacity
const REQUEST_CHANNEL_SIZE: usize = 32;

/// Idle wake-up period while no port is open and no timer is armed
const IDLE_WAKE: Duration = Duration::from_secs(1);

/// A request sent from a [`LinkHandle`] to the link task
#[derive(Debug)]
pub enum LinkRequest {
    /// Queue a command on the link, whatever the connection state
    SendCommand {
        /// Command to send
        command: Command,
        /// Pin payload, if the command carries one
        pins: Option<Pins>,
    },
    /// Open a specific port, bypassing auto-connect
    OpenPort {
        /// Port to open
        port_name: String,
        /// Receives whether the port opened
        reply: oneshot::Sender<bool>,
    },
    /// Close the port without touching auto-connect
    ClosePort,
    /// See [`ConnectionManager::start_auto_connect`]
    StartAutoConnect,
    /// See [`ConnectionManager::stop_auto_connect`]
    StopAutoConnect,
    /// Change the heartbeat period
    SetHeartbeatInterval(Duration),
    /// Switch the controller's mode and remember it
    SetWorkMode(WorkMode),
    /// Replace the diode table
    ResetDiodes(Vec<Pins>),
    /// Add one diode
    ConfigureDiode(Pins),
    /// Remove one diode
    RemoveDiode(Pins),
    /// Stop auto-connect and end the task
    Shutdown,
}

/// Cloneable handle to the link task
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<LinkRequest>,
}

impl LinkHandle {
    async fn request(&self, request: LinkRequest) -> Result<(), ProtocolError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ProtocolError::LinkClosed)
    }

    /// Queue a command, connected or not
    pub async fn send_command(&self, command: Command, pins: Option<Pins>) -> Result<(), ProtocolError> {
        self.request(LinkRequest::SendCommand { command, pins }).await
    }

    /// Open `port_name` directly. Resolves to whether the port opened.
    pub async fn open_port(&self, port_name: impl Into<String>) -> Result<bool, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.request(LinkRequest::OpenPort {
            port_name: port_name.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProtocolError::LinkClosed)
    }

    /// Close the open port
    pub async fn close_port(&self) -> Result<(), ProtocolError> {
        self.request(LinkRequest::ClosePort).await
    }

    /// Start discovering the controller
    pub async fn start_auto_connect(&self) -> Result<(), ProtocolError> {
        self.request(LinkRequest::StartAutoConnect).await
    }

    /// Stop auto-connect and close the port
    pub async fn stop_auto_connect(&self) -> Result<(), ProtocolError> {
        self.request(LinkRequest::StopAutoConnect).await
    }

    /// Change the heartbeat period
    pub async fn set_heartbeat_interval(&self, interval: Duration) -> Result<(), ProtocolError> {
        self.request(LinkRequest::SetHeartbeatInterval(interval)).await
    }

    /// Switch the controller into the mode matching `mode`
    pub async fn set_work_mode(&self, mode: WorkMode) -> Result<(), ProtocolError> {
        self.request(LinkRequest::SetWorkMode(mode)).await
    }

    /// Replace the diode table, replaying it if connected
    pub async fn reset_diodes(&self, diodes: Vec<Pins>) -> Result<(), ProtocolError> {
        self.request(LinkRequest::ResetDiodes(diodes)).await
    }

    /// Add a diode
    pub async fn configure_diode(&self, pins: Pins) -> Result<(), ProtocolError> {
        self.request(LinkRequest::ConfigureDiode(pins)).await
    }

    /// Remove a diode
    pub async fn remove_diode(&self, pins: Pins) -> Result<(), ProtocolError> {
        self.request(LinkRequest::RemoveDiode(pins)).await
    }

    /// Ask the task to close the port and exit
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.request(LinkRequest::Shutdown).await
    }
}

/// Spawn the link task.
///
/// Returns the request handle, the event stream, and the task's join handle.
/// The task exits on [`LinkHandle::shutdown`] or once every handle is dropped.
pub fn spawn_link<T, L>(
    manager: ConnectionManager<T, L>,
) -> (LinkHandle, mpsc::UnboundedReceiver<LinkEvent>, JoinHandle<()>)
where
    T: Transport + 'static,
    L: PortLister + 'static,
{
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(link_loop(manager, rx, event_tx));
    (LinkHandle { tx }, event_rx, task)
}

/// Wait for a `Connected` event and return its port name.
///
/// Other events are discarded.
pub async fn wait_for_connection(
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    timeout: Duration,
) -> Result<String, ProtocolError> {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let LinkEvent::Connected { port_name } = event {
                return Ok(port_name);
            }
        }
        Err(ProtocolError::LinkClosed)
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

struct LinkTask<T: Transport, L: PortLister> {
    manager: ConnectionManager<T, L>,
    diodes: DiodeSync,
    work_mode: Option<WorkMode>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl<T: Transport, L: PortLister> LinkTask<T, L> {
    /// Forward manager events, feeding connection changes to the diode sync
    fn publish(&mut self, now: Instant) {
        while let Some(event) = self.manager.poll_event() {
            let mut commands = self.diodes.handle_event(&event);
            if let LinkEvent::ReceivedCommand(command) = &event {
                commands.extend(self.restore_work_mode(*command));
            }
            tracing::debug!("Link event: {}", event);
            if self.events.send(event).is_err() {
                tracing::trace!("Event receiver dropped");
            }
            self.dispatch(commands, now);
        }
    }

    /// Mode command to resend after the controller acknowledged `acked`
    fn restore_work_mode(&self, acked: Command) -> Option<OutgoingCommand> {
        let leaves_diode_config = matches!(
            acked,
            Command::ModeDiodeConfig | Command::ModeDiodeConfigDel | Command::ModeDiodeClear
        );
        if !leaves_diode_config {
            return None;
        }
        let command = self.work_mode.and_then(WorkMode::command)?;
        tracing::debug!("Restoring {} after {}", command, acked);
        Some(OutgoingCommand::new(command))
    }

    fn dispatch(&mut self, commands: Vec<OutgoingCommand>, now: Instant) {
        for outgoing in commands {
            self.manager
                .link_mut()
                .send_command(outgoing.command, outgoing.pins, now.into_std());
        }
    }

    fn handle_request(&mut self, request: LinkRequest, now: Instant) {
        let std_now = now.into_std();
        match request {
            LinkRequest::SendCommand { command, pins } => {
                self.manager.link_mut().send_command(command, pins, std_now);
            }
            LinkRequest::OpenPort { port_name, reply } => {
                let opened = self.manager.link_mut().open_port(&port_name, std_now);
                let _ = reply.send(opened);
            }
            LinkRequest::ClosePort => self.manager.link_mut().close_port(),
            LinkRequest::StartAutoConnect => self.manager.start_auto_connect(std_now),
            LinkRequest::StopAutoConnect => self.manager.stop_auto_connect(),
            LinkRequest::SetHeartbeatInterval(interval) => {
                self.manager.set_heartbeat_interval(interval, std_now);
            }
            LinkRequest::SetWorkMode(mode) => {
                tracing::info!("Work mode changed to {:?}", mode);
                self.work_mode = Some(mode);
                if let Some(command) = mode.command() {
                    self.manager.link_mut().send_command(command, None, std_now);
                }
            }
            LinkRequest::ResetDiodes(pins) => {
                let commands = self.diodes.reset(pins);
                self.dispatch(commands, now);
            }
            LinkRequest::ConfigureDiode(pins) => {
                let commands = self.diodes.upsert(pins);
                self.dispatch(commands, now);
            }
            LinkRequest::RemoveDiode(pins) => {
                let commands = self.diodes.remove(pins);
                self.dispatch(commands, now);
            }
            LinkRequest::Shutdown => {}
        }
    }

    /// When the loop must wake up next
    fn next_wake(&self, now: Instant) -> Instant {
        let poll = if self.manager.link().is_open() {
            self.manager.config().read_poll_interval()
        } else {
            IDLE_WAKE
        };
        let wake = now + poll;
        match self.manager.next_deadline() {
            Some(deadline) => wake.min(Instant::from_std(deadline)),
            None => wake,
        }
    }
}

async fn link_loop<T: Transport, L: PortLister>(
    manager: ConnectionManager<T, L>,
    mut requests: mpsc::Receiver<LinkRequest>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut task = LinkTask {
        manager,
        diodes: DiodeSync::new(),
        work_mode: None,
        events,
    };
    tracing::debug!("Link task started");

    loop {
        let now = Instant::now();
        task.manager.poll(now.into_std());
        task.publish(now);

        let wake = task.next_wake(now);
        tokio::select! {
            biased;

            request = requests.recv() => match request {
                Some(LinkRequest::Shutdown) => {
                    tracing::debug!("Link task shutdown requested");
                    break;
                }
                Some(request) => {
                    let now = Instant::now();
                    task.handle_request(request, now);
                    task.publish(now);
                }
                None => {
                    tracing::debug!("All link handles dropped, exiting link task");
                    break;
                }
            },

            _ = tokio::time::sleep_until(wake) => {}
        }
    }

    task.manager.stop_auto_connect();
    task.publish(Instant::now());
    tracing::debug!("Link task stopped");
}
