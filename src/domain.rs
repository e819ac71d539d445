//! ==============================================================================
//! domain.rs - value types shared by every part of the pipeline
//! ==============================================================================
//!
//! relationships:
//!     - produced by: device.rs (one Reading per valid data frame)
//!     - stored by: history.rs
//!     - serialized by: hub.rs (websocket payload) and api.rs (json responses)
//!
//! ==============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// one decoded data frame from a controller
///
/// immutable once built; the history store and the hub each get their own copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// name of the device that produced this reading (e.g., "lounge")
    pub source: String,

    /// wall clock time the frame was decoded
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,

    /// per-source counter, starts at 0 and increases by one per reading
    #[serde(rename = "count")]
    pub counter: u64,

    /// values in the order the device declared its sensors
    pub values: Vec<ChannelValue>,
}

impl Reading {
    /// value for a named channel, if the reading has one
    pub fn value_of(&self, channel: &str) -> Option<f64> {
        self.values.iter().find(|v| v.name == channel).map(|v| v.value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    pub name: String,
    pub value: f64,
}

/// an effector command as received from the api layer
///
/// `action` stays a string until it is encoded so that an unknown action can
/// be reported back to the caller instead of failing json parsing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// effector name, resolved against the device's output list
    pub name: String,
    /// "on" or "off"
    pub action: String,
    /// optional duration passed through to the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
}

impl Action {
    /// wire symbol used in `C:` frames
    pub fn symbol(self) -> char {
        match self {
            Action::On => '+',
            Action::Off => '-',
        }
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(Action::On),
            "off" => Ok(Action::Off),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::On => f.write_str("on"),
            Action::Off => f.write_str("off"),
        }
    }
}
