//! Transport and port enumeration seams
//!
//! The device link talks to the controller through [`Transport`], and the
//! connection manager discovers candidate ports through [`PortLister`]. Both
//! are traits so the state machine can run against the real serial stack, the
//! virtual controller, or a test double.

use super::ProtocolError;

/// Byte-stream device the link drives
pub trait Transport: Send {
    /// Open the named port. Opening an already open transport reopens it.
    fn open(&mut self, port_name: &str) -> Result<(), ProtocolError>;

    /// Close the port. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Whether a port is open
    fn is_open(&self) -> bool;

    /// Write a whole frame
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Append whatever input is available to `buf` without blocking.
    /// Returns the number of bytes appended.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, ProtocolError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, port_name: &str) -> Result<(), ProtocolError> {
        (**self).open(port_name)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (**self).write_all(bytes)
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        (**self).read_available(buf)
    }
}

/// Source of port names for auto-connect
pub trait PortLister: Send {
    /// Names of the ports currently present
    fn port_names(&self) -> Vec<String>;
}

/// Fixed list of port names
#[derive(Debug, Clone, Default)]
pub struct StaticPortLister {
    names: Vec<String>,
}

impl StaticPortLister {
    /// Lister that always reports `names`
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl PortLister for StaticPortLister {
    fn port_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable transport and lister shared by the unit tests

    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct MockState {
        pub openable: HashSet<String>,
        pub open_port: Option<String>,
        pub open_attempts: Vec<String>,
        /// (port, bytes) for every write
        pub writes: Vec<(String, Vec<u8>)>,
        pub rx: Vec<u8>,
        pub fail_reads: bool,
        /// Number of upcoming writes that fail
        pub failing_writes: usize,
        pub ports: Vec<String>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn with_openable(ports: &[&str]) -> Self {
            let mock = Self::default();
            mock.state
                .lock()
                .unwrap()
                .openable
                .extend(ports.iter().map(|p| p.to_string()));
            mock
        }

        pub fn push_rx(&self, bytes: &[u8]) {
            self.state.lock().unwrap().rx.extend_from_slice(bytes);
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state
                .lock()
                .unwrap()
                .writes
                .iter()
                .map(|(_, b)| b.clone())
                .collect()
        }

        pub fn fail_next_writes(&self, count: usize) {
            self.state.lock().unwrap().failing_writes = count;
        }

        pub fn clear_written(&self) {
            self.state.lock().unwrap().writes.clear();
        }

        pub fn set_ports(&self, ports: &[&str]) {
            self.state.lock().unwrap().ports = ports.iter().map(|p| p.to_string()).collect();
        }

        pub fn lister(&self) -> MockLister {
            MockLister {
                state: self.state.clone(),
            }
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self, port_name: &str) -> Result<(), ProtocolError> {
            let mut state = self.state.lock().unwrap();
            state.open_attempts.push(port_name.to_string());
            if state.openable.contains(port_name) {
                state.open_port = Some(port_name.to_string());
                Ok(())
            } else {
                Err(ProtocolError::SerialError(format!("cannot open {}", port_name)))
            }
        }

        fn close(&mut self) {
            self.state.lock().unwrap().open_port = None;
        }

        fn is_open(&self) -> bool {
            self.state.lock().unwrap().open_port.is_some()
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
            let mut state = self.state.lock().unwrap();
            let port = state.open_port.clone().ok_or(ProtocolError::NotOpen)?;
            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                return Err(ProtocolError::SerialError("write failed".to_string()));
            }
            state.writes.push((port, bytes.to_vec()));
            Ok(())
        }

        fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, ProtocolError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_reads {
                return Err(ProtocolError::SerialError("device unplugged".to_string()));
            }
            let n = state.rx.len();
            buf.append(&mut state.rx);
            Ok(n)
        }
    }

    #[derive(Debug, Clone)]
    pub struct MockLister {
        state: Arc<Mutex<MockState>>,
    }

    impl PortLister for MockLister {
        fn port_names(&self) -> Vec<String> {
            self.state.lock().unwrap().ports.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_lister() {
        let lister = StaticPortLister::new(["COM3", "COM5"]);
        assert_eq!(lister.port_names(), vec!["COM3".to_string(), "COM5".to_string()]);
    }

    #[test]
    fn test_boxed_transport_delegates() {
        let mock = mock::MockTransport::with_openable(&["COM1"]);
        let mut boxed: Box<dyn Transport> = Box::new(mock.clone());
        assert!(boxed.open("COM2").is_err());
        boxed.open("COM1").unwrap();
        assert!(boxed.is_open());
        boxed.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(mock.written(), vec![vec![1, 2, 3]]);
        boxed.close();
        assert!(!mock.is_open());
    }
}
