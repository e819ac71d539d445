//! ==============================================================================
//! history.rs - bounded recent history per device
//! ==============================================================================
//!
//! purpose:
//!     keeps the last readings of every source so the api can answer
//!     "give me the last N" without touching the devices.
//!
//! design:
//!     - HistoryRing: backing storage of 2W slots. appends go to the end;
//!       when all 2W are used the most recent W are moved to the front
//!       (compaction) and the append continues at slot W. a read returns the
//!       most recent min(available, W+1) in arrival order.
//!     - HistoryStore: one ring per source, created on first sight.
//!     - the store runs as a single tokio task. appends and queries come in on
//!       channels and are handled one at a time, so a query never sees a ring
//!       halfway through compaction.
//!
//! relationships:
//!     - fed by: device.rs (HistoryHandle::listener is a device listener)
//!     - queried by: api.rs
//!
//! ==============================================================================

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::domain::Reading;

/// default retention window (W)
pub const DEFAULT_WINDOW: usize = 1000;

// ==============================================================================
// ring
// ==============================================================================

#[derive(Debug)]
pub struct HistoryRing {
    source: String,
    window: usize,
    items: Vec<Reading>,
}

impl HistoryRing {
    pub fn new(source: impl Into<String>, window: usize) -> Self {
        let window = window.max(1);
        Self { source: source.into(), window, items: Vec::with_capacity(2 * window) }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn push(&mut self, reading: Reading) {
        if self.items.len() == 2 * self.window {
            self.items.drain(..self.window);
        }
        self.items.push(reading);
    }

    /// the readable window: most recent min(available, W+1), oldest first
    pub fn window_slice(&self) -> &[Reading] {
        let start = self.items.len().saturating_sub(self.window + 1);
        &self.items[start..]
    }

    /// most recent min(count, available) readings, oldest first
    pub fn last(&self, count: usize) -> &[Reading] {
        let window = self.window_slice();
        &window[window.len().saturating_sub(count)..]
    }
}

// ==============================================================================
// store
// ==============================================================================

#[derive(Debug)]
pub struct HistoryStore {
    window: usize,
    rings: HashMap<String, HistoryRing>,
}

impl HistoryStore {
    pub fn new(window: usize) -> Self {
        Self { window, rings: HashMap::new() }
    }

    pub fn append(&mut self, reading: Reading) {
        let window = self.window;
        self.rings
            .entry(reading.source.clone())
            .or_insert_with_key(|name| {
                tracing::info!(source = %name, window, "new history ring");
                HistoryRing::new(name.clone(), window)
            })
            .push(reading);
    }

    /// empty for an unknown source
    pub fn get_last(&self, source: &str, count: usize) -> Vec<Reading> {
        self.rings.get(source).map(|ring| ring.last(count).to_vec()).unwrap_or_default()
    }

    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rings.values().map(|r| r.source().to_string()).collect();
        names.sort();
        names
    }
}

// ==============================================================================
// actor
// ==============================================================================

enum HistoryRequest {
    GetLast { source: String, count: usize, reply: oneshot::Sender<Vec<Reading>> },
    Sources { reply: oneshot::Sender<Vec<String>> },
}

/// cheap, clonable access to the history task
#[derive(Clone)]
pub struct HistoryHandle {
    readings: mpsc::Sender<Reading>,
    requests: mpsc::Sender<HistoryRequest>,
}

impl HistoryHandle {
    /// queue to register on a device; all devices share it
    pub fn listener(&self) -> mpsc::Sender<Reading> {
        self.readings.clone()
    }

    pub async fn get_last(&self, source: &str, count: usize) -> Vec<Reading> {
        let (reply, rx) = oneshot::channel();
        let req = HistoryRequest::GetLast { source: source.to_string(), count, reply };
        if self.requests.send(req).await.is_err() {
            tracing::warn!("history store is not running");
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn sources(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(HistoryRequest::Sources { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// spawn the history task
///
/// `queue_capacity` bounds the shared reading queue; a device evicts the
/// store as a listener if it falls that far behind.
pub fn spawn(window: usize, queue_capacity: usize) -> (HistoryHandle, JoinHandle<()>) {
    let (readings_tx, readings_rx) = mpsc::channel(queue_capacity.max(1));
    let (requests_tx, requests_rx) = mpsc::channel(64);
    let task = tokio::spawn(run(HistoryStore::new(window), readings_rx, requests_rx));
    (HistoryHandle { readings: readings_tx, requests: requests_tx }, task)
}

async fn run(
    mut store: HistoryStore,
    mut readings: mpsc::Receiver<Reading>,
    mut requests: mpsc::Receiver<HistoryRequest>,
) {
    tracing::info!(window = store.window, "history store started");
    loop {
        tokio::select! {
            Some(reading) = readings.recv() => store.append(reading),
            Some(request) = requests.recv() => match request {
                HistoryRequest::GetLast { source, count, reply } => {
                    let _ = reply.send(store.get_last(&source, count));
                }
                HistoryRequest::Sources { reply } => {
                    let _ = reply.send(store.sources());
                }
            },
            else => break,
        }
    }
    tracing::info!("history store finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn reading(source: &str, counter: u64) -> Reading {
        Reading { source: source.to_string(), timestamp: Utc::now(), counter, values: Vec::new() }
    }

    fn counters(readings: &[Reading]) -> Vec<u64> {
        readings.iter().map(|r| r.counter).collect()
    }

    #[test]
    fn partial_window_returns_everything() {
        let mut ring = HistoryRing::new("a", 10);
        for i in 0..4 {
            ring.push(reading("a", i));
        }
        assert_eq!(counters(ring.window_slice()), vec![0, 1, 2, 3]);
        assert_eq!(counters(ring.last(2)), vec![2, 3]);
        assert_eq!(counters(ring.last(100)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn window_is_exact_across_compaction() {
        let w = 5;
        let mut ring = HistoryRing::new("a", w);
        for i in 0..(2 * w as u64 + 1) {
            ring.push(reading("a", i));
        }
        // 11 readings in, the most recent W+1 = 6 come back
        assert_eq!(counters(ring.last(100)), vec![5, 6, 7, 8, 9, 10]);
        assert!(ring.items.len() <= 2 * w);
    }

    #[test]
    fn zero_window_is_treated_as_one() {
        let mut ring = HistoryRing::new("a", 0);
        for i in 0..5 {
            ring.push(reading("a", i));
        }
        assert_eq!(counters(ring.last(10)), vec![3, 4]);
    }

    proptest! {
        #[test]
        fn last_n_is_most_recent_in_order(window in 1usize..16, n in 0u64..80, count in 0usize..40) {
            let mut ring = HistoryRing::new("a", window);
            for i in 0..n {
                ring.push(reading("a", i));
                prop_assert!(ring.items.len() <= 2 * window);
            }

            let available = (n as usize).min(window + 1);
            let take = available.min(count) as u64;
            let expected: Vec<u64> = (n - take..n).collect();
            prop_assert_eq!(counters(ring.last(count)), expected);
        }
    }

    #[test]
    fn store_creates_rings_lazily() {
        let mut store = HistoryStore::new(3);
        assert!(store.get_last("a", 5).is_empty());

        store.append(reading("a", 0));
        store.append(reading("b", 0));
        store.append(reading("a", 1));

        assert_eq!(counters(&store.get_last("a", 5)), vec![0, 1]);
        assert_eq!(counters(&store.get_last("b", 5)), vec![0]);
        assert_eq!(store.sources(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn actor_serves_appends_and_queries() {
        let (handle, _task) = spawn(4, 16);
        let feed = handle.listener();
        for i in 0..10 {
            feed.send(reading("lounge", i)).await.unwrap();
        }

        // queries go through the same task, so they run after the appends
        // that were already queued; poll until all ten have landed
        let mut last = Vec::new();
        for _ in 0..100 {
            last = handle.get_last("lounge", 3).await;
            if last.last().map(|r| r.counter) == Some(9) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(counters(&last), vec![7, 8, 9]);
        assert_eq!(handle.get_last("lounge", 100).await.len(), 5);
        assert!(handle.get_last("garage", 3).await.is_empty());
        assert_eq!(handle.sources().await, vec!["lounge"]);
    }
}
