//! ==============================================================================
//! device.rs - device actor for one serial controller
//! ==============================================================================
//!
//! purpose:
//!     owns one controller connection. a dedicated read loop thread decodes
//!     the line protocol, keeps the sensor/effector name tables current and
//!     hands every reading to the registered listeners.
//!
//! concurrency:
//!     - read loop: blocking i/o on its own thread, bounded by the link's read
//!       timeout so a stop request is seen within about a second.
//!     - listeners: bounded tokio mpsc queues. delivery is try_send; a full
//!       queue gets its listener evicted so one slow consumer can't stall
//!       ingestion.
//!     - listener add/remove requests are queued and applied by the read loop
//!       itself, so the registry has a single owner.
//!     - name tables sit behind an RwLock and are swapped wholesale; readers
//!       get snapshot copies.
//!
//! relationships:
//!     - uses: protocol.rs (LineDecoder, Frame, encode_command)
//!     - uses: link.rs (Connector)
//!     - feeds: history.rs, hub.rs (as listeners)
//!     - used by: api.rs, main.rs
//!
//! ==============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::domain::{Action, ChannelValue, Command, Reading};
use crate::error::{DeviceError, ProtocolError};
use crate::link::{Connector, LinkConfig};
use crate::protocol::{encode_command, Frame, LineDecoder};

const READ_CHUNK: usize = 1024;

/// identifies a registered listener so it can be removed later
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ==============================================================================
// listener registry
// ==============================================================================

enum ListenerOp {
    Add { id: ListenerId, label: String, queue: mpsc::Sender<Reading> },
    Remove(ListenerId),
}

struct Listener {
    label: String,
    queue: mpsc::Sender<Reading>,
}

/// fan-out targets for one device
#[derive(Default)]
struct ListenerRegistry {
    listeners: HashMap<ListenerId, Listener>,
}

impl ListenerRegistry {
    fn apply(&mut self, op: ListenerOp) {
        match op {
            ListenerOp::Add { id, label, queue } => {
                self.listeners.insert(id, Listener { label, queue });
            }
            ListenerOp::Remove(id) => {
                self.listeners.remove(&id);
            }
        }
    }

    /// hand a copy of the reading to every listener without blocking
    ///
    /// returns the labels of listeners evicted for being full. an evicted
    /// listener is gone for good; it has to be added again.
    fn publish(&mut self, device: &str, reading: &Reading) -> Vec<String> {
        let mut evicted = Vec::new();
        self.listeners.retain(|_, listener| match listener.queue.try_send(reading.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::error!(device, listener = %listener.label, "listener queue full, evicting");
                evicted.push(listener.label.clone());
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(device, listener = %listener.label, "listener gone, removing");
                false
            }
        });
        evicted
    }

    fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// state that lives inside the read loop while it runs and is parked on the
/// device between sessions
struct Ingest {
    registry: ListenerRegistry,
    ops: std_mpsc::Receiver<ListenerOp>,
    counter: u64,
}

impl Ingest {
    fn new() -> (Self, std_mpsc::Sender<ListenerOp>) {
        let (tx, rx) = std_mpsc::channel();
        (Self { registry: ListenerRegistry::default(), ops: rx, counter: 0 }, tx)
    }

    fn apply_pending(&mut self) {
        while let Ok(op) = self.ops.try_recv() {
            self.registry.apply(op);
        }
    }
}

// ==============================================================================
// device
// ==============================================================================

#[derive(Debug, Default, Clone)]
struct ChannelTables {
    inputs: Vec<String>,
    outputs: Vec<String>,
}

struct Session {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    handle: JoinHandle<Ingest>,
}

struct Slot {
    /// set while stop() has taken the session and is joining its thread
    stopping: bool,
    ops: std_mpsc::Sender<ListenerOp>,
    next_listener: u64,
    /// parked ingest state; None while a session owns it
    ingest: Option<Ingest>,
    session: Option<Session>,
}

/// one serial controller
pub struct Device {
    name: String,
    tables: Arc<RwLock<ChannelTables>>,
    last_error: Arc<Mutex<Option<String>>>,
    slot: Mutex<Slot>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        let (ingest, ops) = Ingest::new();
        Self {
            name: name.into(),
            tables: Arc::default(),
            last_error: Arc::default(),
            slot: Mutex::new(Slot {
                stopping: false,
                ops,
                next_listener: 0,
                ingest: Some(ingest),
                session: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// open the link and spawn the read loop
    pub fn start(&self, connector: &dyn Connector, config: &LinkConfig) -> Result<(), DeviceError> {
        let mut slot = lock(&self.slot);
        if slot.stopping {
            return Err(DeviceError::Stopping(self.name.clone()));
        }
        self.reap_finished(&mut slot);
        if slot.session.is_some() {
            return Err(DeviceError::AlreadyRunning(self.name.clone()));
        }

        let link = connector.open(config).map_err(|source| {
            let err = DeviceError::Connection { device: self.name.clone(), source };
            *lock(&self.last_error) = Some(err.to_string());
            err
        })?;

        let Some(ingest) = slot.ingest.take() else {
            return Err(DeviceError::LoopPanicked(self.name.clone()));
        };

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let read_loop = ReadLoop {
            name: self.name.clone(),
            tables: Arc::clone(&self.tables),
            last_error: Arc::clone(&self.last_error),
            stop: Arc::clone(&stop),
            finished: Arc::clone(&finished),
        };
        let mut reader = link.reader;

        let handle = std::thread::Builder::new()
            .name(format!("device-{}", self.name))
            .spawn(move || read_loop.run(&mut *reader, ingest));

        let handle = match handle {
            Ok(handle) => handle,
            Err(source) => {
                // the closure (and the ingest state inside it) is gone; start over
                let (ingest, ops) = Ingest::new();
                slot.ingest = Some(ingest);
                slot.ops = ops;
                return Err(DeviceError::Connection { device: self.name.clone(), source });
            }
        };

        *lock(&self.last_error) = None;
        slot.session = Some(Session {
            stop,
            finished,
            writer: Arc::new(Mutex::new(link.writer)),
            handle,
        });
        tracing::info!(device = %self.name, port = %config.port, "device started");
        Ok(())
    }

    /// ask the read loop to stop and wait until it has
    ///
    /// blocks for at most about one read timeout. a loop that already ended on
    /// its own (read error) is cleaned up and reported as NotRunning.
    pub fn stop(&self) -> Result<(), DeviceError> {
        let session = {
            let mut slot = lock(&self.slot);
            let session =
                slot.session.take().ok_or_else(|| DeviceError::NotRunning(self.name.clone()))?;
            slot.stopping = true;
            session
        };

        let was_running = !session.finished.load(Ordering::Acquire);
        session.stop.store(true, Ordering::Release);
        let joined = session.handle.join();

        let mut slot = lock(&self.slot);
        slot.stopping = false;
        match joined {
            Ok(ingest) => slot.ingest = Some(ingest),
            Err(_) => {
                let (ingest, ops) = Ingest::new();
                slot.ingest = Some(ingest);
                slot.ops = ops;
                tracing::error!(device = %self.name, "read loop panicked, listeners dropped");
                return Err(DeviceError::LoopPanicked(self.name.clone()));
            }
        }

        if was_running {
            tracing::info!(device = %self.name, "device stopped");
            Ok(())
        } else {
            Err(DeviceError::NotRunning(self.name.clone()))
        }
    }

    /// true from a successful start until stop() has seen the loop exit
    pub fn is_running(&self) -> bool {
        let slot = lock(&self.slot);
        slot.stopping || slot.session.as_ref().is_some_and(|s| !s.finished.load(Ordering::Acquire))
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// snapshot of the sensor names
    pub fn input_types(&self) -> Vec<String> {
        read(&self.tables).inputs.clone()
    }

    /// snapshot of the effector names
    pub fn output_types(&self) -> Vec<String> {
        read(&self.tables).outputs.clone()
    }

    pub fn sensor_position(&self, name: &str) -> Option<usize> {
        read(&self.tables).inputs.iter().position(|s| s == name)
    }

    /// register a fan-out target; takes effect at the read loop's next pass
    pub fn add_listener(&self, label: &str, queue: mpsc::Sender<Reading>) -> ListenerId {
        let mut slot = lock(&self.slot);
        let id = ListenerId(slot.next_listener);
        slot.next_listener += 1;
        let _ = slot.ops.send(ListenerOp::Add { id, label: label.to_string(), queue });
        id
    }

    #[allow(dead_code)]
    pub fn remove_listener(&self, id: ListenerId) {
        let _ = lock(&self.slot).ops.send(ListenerOp::Remove(id));
    }

    /// validate and write one effector command
    pub fn send_command(&self, cmd: &Command) -> Result<(), DeviceError> {
        let index = read(&self.tables)
            .outputs
            .iter()
            .position(|o| *o == cmd.name)
            .ok_or_else(|| DeviceError::UnknownEffector(cmd.name.clone()))?;
        let action: Action =
            cmd.action.parse().map_err(|_| DeviceError::UnknownAction(cmd.action.clone()))?;
        let msg = encode_command(index, action, cmd.duration);

        let writer = lock(&self.slot).session.as_ref().map(|s| Arc::clone(&s.writer));
        let Some(writer) = writer else {
            return Err(DeviceError::Connection {
                device: self.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "device not started"),
            });
        };

        tracing::info!(device = %self.name, command = %msg.trim_end(), "sending command");
        let mut writer = lock(&writer);
        writer.write_all(msg.as_bytes()).and_then(|()| writer.flush()).map_err(|source| {
            tracing::error!(device = %self.name, error = %source, "command write failed");
            DeviceError::Connection { device: self.name.clone(), source }
        })
    }

    fn reap_finished(&self, slot: &mut Slot) {
        let finished = slot.session.as_ref().is_some_and(|s| s.finished.load(Ordering::Acquire));
        if !finished {
            return;
        }
        if let Some(session) = slot.session.take() {
            match session.handle.join() {
                Ok(ingest) => slot.ingest = Some(ingest),
                Err(_) => {
                    let (ingest, ops) = Ingest::new();
                    slot.ingest = Some(ingest);
                    slot.ops = ops;
                }
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.slot).session.as_ref() {
            session.stop.store(true, Ordering::Release);
        }
    }
}

// ==============================================================================
// read loop
// ==============================================================================

struct ReadLoop {
    name: String,
    tables: Arc<RwLock<ChannelTables>>,
    last_error: Arc<Mutex<Option<String>>>,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl ReadLoop {
    fn run(self, reader: &mut (dyn std::io::Read + Send), mut ingest: Ingest) -> Ingest {
        tracing::info!(device = %self.name, "read loop started");
        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; READ_CHUNK];

        while !self.stop.load(Ordering::Acquire) {
            ingest.apply_pending();

            match reader.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    tracing::trace!(device = %self.name, bytes = n, "received");
                    for line in decoder.push(&buf[..n]) {
                        self.dispatch(&line, &mut ingest);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    tracing::error!(device = %self.name, error = %e, "read error, stopping");
                    *lock(&self.last_error) = Some(e.to_string());
                    break;
                }
            }
        }

        self.finished.store(true, Ordering::Release);
        tracing::info!(device = %self.name, "read loop finished");
        ingest
    }

    fn dispatch(&self, line: &str, ingest: &mut Ingest) {
        let frame = match Frame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(device = %self.name, line, error = %e, "dropping frame");
                return;
            }
        };

        match frame {
            Frame::Inputs(names) => {
                tracing::info!(device = %self.name, ?names, "input types");
                write(&self.tables).inputs = names;
            }
            Frame::Outputs(names) => {
                tracing::info!(device = %self.name, ?names, "output types");
                write(&self.tables).outputs = names;
            }
            Frame::Data(values) => {
                let inputs = read(&self.tables).inputs.clone();
                let reading = match build_reading(&self.name, &inputs, &values, ingest.counter) {
                    Ok(reading) => reading,
                    Err(e) => {
                        tracing::warn!(device = %self.name, line, error = %e, "dropping frame");
                        return;
                    }
                };
                ingest.counter += 1;
                ingest.apply_pending();
                let evicted = ingest.registry.publish(&self.name, &reading);
                if !evicted.is_empty() {
                    // surfaces through /api/sources, nothing re-adds the listener
                    *lock(&self.last_error) =
                        Some(format!("listener(s) evicted for falling behind: {}", evicted.join(", ")));
                }
                tracing::debug!(
                    device = %self.name,
                    count = reading.counter,
                    listeners = ingest.registry.len(),
                    "reading published"
                );
            }
            Frame::CommandEcho(payload) => {
                tracing::debug!(device = %self.name, payload = %payload, "command echo");
            }
        }
    }
}

/// pair data values with sensor names by position
fn build_reading(
    source: &str,
    inputs: &[String],
    values: &[f64],
    counter: u64,
) -> Result<Reading, ProtocolError> {
    if inputs.len() != values.len() {
        return Err(ProtocolError::LengthMismatch { expected: inputs.len(), got: values.len() });
    }
    Ok(Reading {
        source: source.to_string(),
        timestamp: Utc::now(),
        counter,
        values: inputs
            .iter()
            .zip(values)
            .map(|(name, value)| ChannelValue { name: name.clone(), value: *value })
            .collect(),
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

// ==============================================================================
// device directory
// ==============================================================================

/// name -> device lookup for the api layer
#[derive(Default, Clone)]
pub struct DeviceDirectory {
    devices: HashMap<String, Arc<Device>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, device: Arc<Device>) {
        self.devices.insert(device.name().to_string(), device);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }
}
