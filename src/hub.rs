//! ==============================================================================
//! hub.rs - websocket broadcast hub
//! ==============================================================================
//!
//! purpose:
//!     distributes every reading to all live websocket clients.
//!
//! backpressure policy:
//!     each client has a bounded outbound queue (256). a broadcast does a
//!     non-blocking enqueue per client; a client whose queue is full is
//!     evicted on the spot (its queue is closed and it leaves the set). one
//!     slow consumer never delays the others or the next broadcast.
//!
//! design:
//!     - Hub: plain state (the client set) with register/unregister/broadcast.
//!     - the hub task owns a Hub and is the only thing that touches it.
//!       control messages and readings arrive on channels.
//!     - the hub holds the only sender of a client's queue, so dropping it is
//!       what closes the queue; the client's pump sees that and sends a close.
//!
//! relationships:
//!     - fed by: device.rs (HubHandle::listener is a device listener)
//!     - used by: api.rs (register on websocket upgrade)
//!     - drained by: pump.rs (one pump per client)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::domain::Reading;

/// outbound queue depth per client
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

/// one serialized message for clients
pub type Payload = Arc<str>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// the hub's side of a websocket client
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    outbound: mpsc::Sender<Payload>,
}

impl Client {
    /// new client plus the receiving end of its queue (for its pump)
    pub fn new() -> (Self, mpsc::Receiver<Payload>) {
        Self::with_capacity(CLIENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let id = ClientId(NEXT_CLIENT.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, outbound: tx }, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }
}

// ==============================================================================
// hub state
// ==============================================================================

#[derive(Debug, Default)]
pub struct Hub {
    clients: HashMap<ClientId, mpsc::Sender<Payload>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// add a client; registering an id that is already live replaces the old
    /// queue, so a client never gets two copies of one broadcast
    pub fn register(&mut self, client: Client) {
        tracing::info!(client = %client.id, "adding client");
        if self.clients.insert(client.id, client.outbound).is_some() {
            tracing::debug!(client = %client.id, "client was already registered, queue replaced");
        }
    }

    /// remove a client and close its queue; false if it wasn't registered
    pub fn unregister(&mut self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            tracing::info!(client = %id, "removing client");
        }
        removed
    }

    /// enqueue for every client without waiting; returns the evicted ids
    pub fn broadcast(&mut self, payload: &Payload) -> Vec<ClientId> {
        let mut evicted = Vec::new();
        self.clients.retain(|id, queue| match queue.try_send(Arc::clone(payload)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client = %id, "client too slow, evicting");
                evicted.push(*id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(client = %id, "client queue closed, removing");
                false
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ==============================================================================
// hub task
// ==============================================================================

#[derive(Debug)]
pub enum HubMessage {
    Register(Client),
    Unregister(ClientId),
    Broadcast(Payload),
}

#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::Sender<HubMessage>,
    readings: mpsc::Sender<Reading>,
}

impl HubHandle {
    pub async fn register(&self, client: Client) {
        self.send(HubMessage::Register(client)).await;
    }

    pub async fn unregister(&self, id: ClientId) {
        self.send(HubMessage::Unregister(id)).await;
    }

    /// push an already serialized payload to every client
    #[allow(dead_code)]
    pub async fn broadcast(&self, payload: Payload) {
        self.send(HubMessage::Broadcast(payload)).await;
    }

    /// queue to register on a device; readings are serialized and broadcast
    pub fn listener(&self) -> mpsc::Sender<Reading> {
        self.readings.clone()
    }

    async fn send(&self, msg: HubMessage) {
        if self.control.send(msg).await.is_err() {
            tracing::warn!("broadcast hub is not running");
        }
    }
}

/// spawn the hub task
pub fn spawn(readings_capacity: usize) -> (HubHandle, JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::channel(64);
    let (readings_tx, readings_rx) = mpsc::channel(readings_capacity.max(1));
    let task = tokio::spawn(run(Hub::new(), control_rx, readings_rx));
    (HubHandle { control: control_tx, readings: readings_tx }, task)
}

async fn run(
    mut hub: Hub,
    mut control: mpsc::Receiver<HubMessage>,
    mut readings: mpsc::Receiver<Reading>,
) {
    tracing::info!("broadcast hub started");
    loop {
        tokio::select! {
            // registrations land before any reading queued after them
            biased;
            Some(msg) = control.recv() => match msg {
                HubMessage::Register(client) => hub.register(client),
                HubMessage::Unregister(id) => {
                    hub.unregister(id);
                }
                HubMessage::Broadcast(payload) => {
                    hub.broadcast(&payload);
                }
            },
            Some(reading) = readings.recv() => {
                // nobody to send to, the reading is just consumed
                if hub.is_empty() {
                    continue;
                }
                match serde_json::to_string(&reading) {
                    Ok(json) => {
                        tracing::debug!(source = %reading.source, clients = hub.len(), "broadcasting reading");
                        hub.broadcast(&Payload::from(json));
                    }
                    Err(e) => tracing::error!(error = %e, "unable to serialize reading"),
                }
            },
            else => break,
        }
    }
    tracing::info!("broadcast hub finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::mpsc::error::TryRecvError;

    fn payload(s: &str) -> Payload {
        Payload::from(s)
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p.to_string());
        }
        out
    }

    #[test]
    fn slow_client_is_evicted_once_and_others_get_everything() {
        let mut hub = Hub::new();
        let (slow, mut slow_rx) = Client::with_capacity(2);
        let slow_id = slow.id();
        hub.register(slow);

        let mut healthy = Vec::new();
        for _ in 0..3 {
            let (client, rx) = Client::with_capacity(64);
            hub.register(client);
            healthy.push(rx);
        }

        let mut evicted = Vec::new();
        for i in 0..10 {
            evicted.extend(hub.broadcast(&payload(&format!("m{i}"))));
        }

        assert_eq!(evicted, vec![slow_id]);
        assert_eq!(hub.len(), 3);
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        for rx in &mut healthy {
            assert_eq!(drain(rx), expected);
        }

        // the slow client keeps what it had, then sees its queue closed
        assert_eq!(drain(&mut slow_rx), vec!["m0", "m1"]);
        assert_eq!(slow_rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn unregister_closes_queue_and_is_idempotent() {
        let mut hub = Hub::new();
        let (client, mut rx) = Client::new();
        let id = client.id();
        hub.register(client);

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert!(hub.is_empty());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn duplicate_registration_delivers_once() {
        let mut hub = Hub::new();
        let (client, mut rx) = Client::new();
        let id = client.id();
        let again = Client { id, outbound: client.outbound.clone() };
        hub.register(client);
        hub.register(again);

        hub.broadcast(&payload("once"));
        assert_eq!(hub.len(), 1);
        assert_eq!(drain(&mut rx), vec!["once"]);
    }

    #[test]
    fn client_with_dropped_pump_is_removed_silently() {
        let mut hub = Hub::new();
        let (client, rx) = Client::new();
        hub.register(client);
        drop(rx);

        assert!(hub.broadcast(&payload("x")).is_empty());
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn hub_task_serializes_readings() {
        let (handle, _task) = spawn(16);
        let (client, mut rx) = Client::new();
        handle.register(client).await;

        let reading = Reading {
            source: "lounge".to_string(),
            timestamp: Utc::now(),
            counter: 3,
            values: Vec::new(),
        };
        handle.listener().send(reading).await.unwrap();

        let msg = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(json["source"], "lounge");
        assert_eq!(json["count"], 3);
    }

    #[tokio::test]
    async fn hub_task_stays_responsive_with_a_stuck_client() {
        let (handle, _task) = spawn(16);
        let (stuck, _stuck_rx) = Client::with_capacity(1);
        let (ok, mut ok_rx) = Client::new();
        handle.register(stuck).await;
        handle.register(ok).await;

        let sent = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            for i in 0..50 {
                handle.broadcast(payload(&format!("{i}"))).await;
            }
        })
        .await;
        assert!(sent.is_ok(), "hub stalled");

        for i in 0..50 {
            assert_eq!(&*ok_rx.recv().await.unwrap(), format!("{i}"));
        }
    }

    #[tokio::test]
    async fn readings_are_drained_with_no_clients() {
        let (handle, _task) = spawn(2);
        let reading = |counter| Reading {
            source: "lounge".to_string(),
            timestamp: Utc::now(),
            counter,
            values: Vec::new(),
        };
        let listener = handle.listener();
        for i in 0..10 {
            let sent = tokio::time::timeout(std::time::Duration::from_secs(2), listener.send(reading(i))).await;
            assert!(matches!(sent, Ok(Ok(()))), "hub stopped draining readings");
        }

        // register and readings travel on different channels, so keep
        // sending until the client has been added
        let (client, mut rx) = Client::new();
        handle.register(client).await;
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let mut counter = 10;
            loop {
                listener.send(reading(counter)).await.unwrap();
                counter += 1;
                if let Ok(Some(msg)) = tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv()).await {
                    return msg;
                }
            }
        })
        .await
        .expect("client never got a reading");
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert!(json["count"].as_u64().unwrap() >= 10);
    }
}
