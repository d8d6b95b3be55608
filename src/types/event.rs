use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    message::Message,
};

/// QMP timestamp, typically included in event messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since epoch.
    pub seconds: i64,

    /// Microseconds within the second.
    pub microseconds: i64,
}

/// A decoded event.
///
/// `data` keeps the arbitrary JSON payload; deserialize it into your own type
/// when needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name.
    #[serde(rename = "event")]
    pub name: String,

    /// Event data payload.
    #[serde(default)]
    pub data: Value,

    /// Optional timestamp.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// Decode an event from a received message.
    pub fn from_message(msg: &Message) -> Result<Self> {
        serde_json::from_value(msg.clone().into()).map_err(Error::from)
    }
}
