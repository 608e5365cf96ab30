//! Events published to the application layer

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Command, StatusPayload};

/// Something the application should know about the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LinkEvent {
    /// Echo handshake succeeded on this port
    Connected {
        /// Port the controller answered on
        port_name: String,
    },
    /// A live connection was lost or auto-connect was stopped
    Disconnected,
    /// Probing failed, or a port error occurred while managed
    ConnectionError(String),
    /// Pin state reported by the controller
    StatusReceived(StatusPayload),
    /// Any inbound command other than `Echo` and `StatusUpdate`
    ReceivedCommand(Command),
    /// The controller answered an echo
    EchoReceived,
    /// A transport read or write failed
    PortError(String),
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Connected { port_name } => write!(f, "connected on {}", port_name),
            LinkEvent::Disconnected => f.write_str("disconnected"),
            LinkEvent::ConnectionError(message) => write!(f, "connection error: {}", message),
            LinkEvent::StatusReceived(status) => {
                write!(f, "status pins={} leds=[", status.pins)?;
                for (i, led) in status.leds.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", led)?;
                }
                f.write_str("]")
            }
            LinkEvent::ReceivedCommand(command) => write!(f, "received {}", command),
            LinkEvent::EchoReceived => f.write_str("echo"),
            LinkEvent::PortError(description) => write!(f, "port error: {}", description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Pins;

    #[test]
    fn test_display() {
        let event = LinkEvent::StatusReceived(StatusPayload::new(
            Pins::new(1, 2),
            vec![Pins::new(3, 4), Pins::new(5, 6)],
        ));
        assert_eq!(event.to_string(), "status pins=1-2 leds=[3-4, 5-6]");
        assert_eq!(
            LinkEvent::Connected {
                port_name: "COM5".into()
            }
            .to_string(),
            "connected on COM5"
        );
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&LinkEvent::Connected {
            port_name: "COM5".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"connected","data":{"port_name":"COM5"}}"#);

        let json = serde_json::to_string(&LinkEvent::ReceivedCommand(Command::ModeRun)).unwrap();
        assert_eq!(json, r#"{"type":"received_command","data":"ModeRun"}"#);
    }
}
