//! ==============================================================================
//! error.rs - error taxonomy for the ingestion pipeline
//! ==============================================================================
//!
//! propagation:
//!     - ProtocolError: handled inside the read loop (logged, frame dropped)
//!     - DeviceError: returned to whoever called start/stop/send_command
//!     - PumpError: ends one websocket client, never seen by anyone else
//!
//! ==============================================================================

use thiserror::Error;

/// errors returned by device lifecycle and command operations
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} is already running")]
    AlreadyRunning(String),

    #[error("device {0} is not running")]
    NotRunning(String),

    /// a stop is still waiting for the read loop to exit
    #[error("device {0} is stopping")]
    Stopping(String),

    #[error("unable to find effector '{0}'")]
    UnknownEffector(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// open or write failure on the underlying link
    #[error("connection error on {device}: {source}")]
    Connection {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("read loop for {0} panicked")]
    LoopPanicked(String),
}

/// a single malformed line from a controller
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("frame '{0}' has no ':' after its tag")]
    MissingSeparator(String),

    #[error("unknown frame tag '{0}'")]
    UnknownTag(char),

    #[error("value '{0}' is not a number")]
    InvalidValue(String),

    #[error("data frame has {got} values but {expected} sensors are declared")]
    LengthMismatch { expected: usize, got: usize },
}

/// reasons a client output pump stopped writing
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("websocket write failed: {0}")]
    Write(String),

    #[error("websocket write timed out")]
    Timeout,
}
