//! ==============================================================================
//! pump.rs - per-client websocket output pump
//! ==============================================================================
//!
//! purpose:
//!     moves payloads from a client's outbound queue onto its websocket and
//!     keeps the connection alive with periodic pings.
//!
//! behaviour:
//!     - a payload wakes the pump; anything that queued up behind it is
//!       coalesced into the same text frame, one payload per line.
//!     - the queue closing (hub dropped the client) means shut down: a close
//!       frame is sent and the pump returns.
//!     - every PING_PERIOD a ping is sent.
//!     - every write has a WRITE_WAIT deadline. a failed or late write ends
//!       the pump.
//!     - however the pump ends, the client is unregistered from the hub.
//!
//! the inbound half only has to notice the peer going away; drain_inbound
//! reads until a close, an error, or PONG_WAIT of silence.
//!
//! ==============================================================================

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::error::PumpError;
use crate::hub::{ClientId, HubHandle, Payload, CLIENT_QUEUE_CAPACITY};

/// deadline for one websocket write
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// how long the peer may stay silent (a pong counts) before we give up
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// ping interval, must be shorter than PONG_WAIT
pub const PING_PERIOD: Duration = Duration::from_secs(54);

#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub write_wait: Duration,
    pub ping_period: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self { write_wait: WRITE_WAIT, ping_period: PING_PERIOD }
    }
}

/// run until the queue closes or a write fails, then unregister the client
pub async fn run_output_pump<S>(
    id: ClientId,
    mut sink: S,
    outbound: mpsc::Receiver<Payload>,
    hub: HubHandle,
    config: PumpConfig,
) -> Result<(), PumpError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let result = pump(&mut sink, outbound, config).await;
    match &result {
        Ok(()) => tracing::debug!(client = %id, "output pump finished"),
        Err(e) => tracing::info!(client = %id, error = %e, "output pump stopped"),
    }
    hub.unregister(id).await;
    result
}

async fn pump<S>(
    sink: &mut S,
    mut outbound: mpsc::Receiver<Payload>,
    config: PumpConfig,
) -> Result<(), PumpError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = time::interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(first) => {
                    let text = coalesce(&first, &mut outbound);
                    write(sink, Message::Text(text), config.write_wait).await?;
                }
                None => {
                    // best effort, the peer may already be gone
                    let _ = write(sink, Message::Close(None), config.write_wait).await;
                    return Ok(());
                }
            },
            _ = ticker.tick() => {
                write(sink, Message::Ping(Vec::new()), config.write_wait).await?;
            }
        }
    }
}

/// join `first` with whatever is already queued, without waiting for more
fn coalesce(first: &str, outbound: &mut mpsc::Receiver<Payload>) -> String {
    let mut text = String::from(first);
    for _ in 0..CLIENT_QUEUE_CAPACITY {
        match outbound.try_recv() {
            Ok(next) => {
                text.push('\n');
                text.push_str(&next);
            }
            Err(_) => break,
        }
    }
    text
}

async fn write<S>(sink: &mut S, msg: Message, wait: Duration) -> Result<(), PumpError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match time::timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PumpError::Write(e.to_string())),
        Err(_) => Err(PumpError::Timeout),
    }
}

/// read and discard inbound frames until the peer closes, errors, or goes
/// quiet for longer than `pong_wait`
pub async fn drain_inbound<St, E>(id: ClientId, mut stream: St, pong_wait: Duration)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        match time::timeout(pong_wait, stream.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                tracing::debug!(client = %id, error = %e, "websocket read failed");
                break;
            }
            Err(_) => {
                tracing::info!(client = %id, "no pong from client, closing");
                break;
            }
        }
    }
}
