//! ==============================================================================
//! link.rs - connection abstraction for controllers
//! ==============================================================================
//!
//! purpose:
//!     gives the device actor a read half and a write half without caring
//!     whether they come from a real tty or from an in-memory test double.
//!
//! design:
//!     - the read half MUST return within the configured read timeout
//!       (io::ErrorKind::TimedOut when nothing arrived) so the read loop can
//!       notice a stop request.
//!     - the write half is shared behind a mutex by send_command.
//!
//! relationships:
//!     - used by: device.rs (Device::start)
//!     - uses: serialport (real hardware)
//!
//! ==============================================================================

use std::io::{self, Read, Write};
use std::time::Duration;

/// default line speed for the controllers
pub const DEFAULT_BAUD: u32 = 9600;

/// how long a single read may block before the loop re-checks its stop flag
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// where and how to open one controller
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// tty path, e.g. /dev/ttyUSB0
    pub port: String,
    pub baud: u32,
    pub read_timeout: Duration,
}

impl LinkConfig {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self { port: port.into(), baud, read_timeout: READ_TIMEOUT }
    }
}

/// an opened connection, split into halves
pub struct Link {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// opens links; one implementation per kind of transport
pub trait Connector: Send + Sync {
    fn open(&self, config: &LinkConfig) -> io::Result<Link>;
}

// ==============================================================================================
// REAL IMPLEMENTATION (serial tty)
// ==============================================================================================

pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, config: &LinkConfig) -> io::Result<Link> {
        let port = serialport::new(&config.port, config.baud)
            .timeout(config.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()?;
        let writer = port.try_clone()?;

        tracing::debug!(port = %config.port, baud = config.baud, "serial port opened");
        Ok(Link { reader: Box::new(port), writer: Box::new(writer) })
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (for tests, no hardware)
// ==============================================================================================

#[cfg(test)]
pub mod memory {
    use super::{Connector, Link, LinkConfig};
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::sync::{Arc, Mutex};

    /// create a connector and the "device side" handle that drives it
    pub fn pair() -> (MemoryConnector, MemoryPeer) {
        let (tx, rx) = mpsc::channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let fail_writes = Arc::new(AtomicBool::new(false));
        let connector = MemoryConnector {
            incoming: Arc::new(Mutex::new(rx)),
            written: Arc::clone(&written),
            fail_writes: Arc::clone(&fail_writes),
            fail_open: false,
        };
        (connector, MemoryPeer { feed: tx, written, fail_writes })
    }

    pub struct MemoryConnector {
        incoming: Arc<Mutex<Receiver<Vec<u8>>>>,
        written: Arc<Mutex<Vec<u8>>>,
        fail_writes: Arc<AtomicBool>,
        fail_open: bool,
    }

    impl MemoryConnector {
        pub fn failing() -> Self {
            let (connector, _peer) = pair();
            Self { fail_open: true, ..connector }
        }
    }

    impl Connector for MemoryConnector {
        fn open(&self, config: &LinkConfig) -> io::Result<Link> {
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such port"));
            }
            Ok(Link {
                reader: Box::new(MemoryReader {
                    incoming: Arc::clone(&self.incoming),
                    pending: Vec::new(),
                    timeout: config.read_timeout,
                }),
                writer: Box::new(MemoryWriter {
                    written: Arc::clone(&self.written),
                    fail: Arc::clone(&self.fail_writes),
                }),
            })
        }
    }

    /// test side of the link
    pub struct MemoryPeer {
        feed: Sender<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        fail_writes: Arc<AtomicBool>,
    }

    impl MemoryPeer {
        /// bytes the controller "sends"
        pub fn send(&self, bytes: &[u8]) {
            let _ = self.feed.send(bytes.to_vec());
        }

        /// everything written to the controller so far, as text
        pub fn written(&self) -> String {
            String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
        }

        pub fn fail_writes(&self) {
            self.fail_writes.store(true, Ordering::SeqCst);
        }
    }

    struct MemoryReader {
        incoming: Arc<Mutex<Receiver<Vec<u8>>>>,
        pending: Vec<u8>,
        timeout: std::time::Duration,
    }

    impl Read for MemoryReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                let next = self.incoming.lock().unwrap().recv_timeout(self.timeout);
                match next {
                    Ok(chunk) => self.pending = chunk,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "unplugged"))
                    }
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    struct MemoryWriter {
        written: Arc<Mutex<Vec<u8>>>,
        fail: Arc<AtomicBool>,
    }

    impl Write for MemoryWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
