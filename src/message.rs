//! QMP wire messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// One QMP protocol unit: a JSON object.
///
/// Messages are created by the reader task from one line of input, or by a
/// caller that wants to send something [`Message::command`] cannot express.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

/// How an incoming message must be routed.
///
/// Decided once, at the routing boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// An asynchronous event (carries `event`).
    Event,
    /// A reply to the request with this id.
    Reply {
        /// The `id` member, rendered as a string.
        id: String,
    },
    /// Neither `event` nor `id`: the server could not parse what we sent.
    Unidentified,
}

impl Message {
    /// Create an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an `execute` (or `exec-oob`) request.
    ///
    /// No `id` is set; one is assigned when the message is executed.
    #[must_use]
    pub fn command(command: &str, arguments: Option<Value>, out_of_band: bool) -> Self {
        let mut msg = Self::new();
        let key = if out_of_band { "exec-oob" } else { "execute" };
        msg.insert(key, Value::from(command));
        if let Some(arguments) = arguments {
            msg.insert("arguments", arguments);
        }
        msg
    }

    /// Parse one line of input.
    pub fn parse(line: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(line)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::protocol(format!(
                "expected a JSON object, got: {other}"
            ))),
        }
    }

    /// Serialize to a single line of JSON, without the terminator.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(&self.0).map_err(Error::from)
    }

    /// Look up a member.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether a member is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Set a member, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Remove a member.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// The `id` member, if any.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        self.get("id")
    }

    /// The command name from `execute` or `exec-oob`.
    #[must_use]
    pub fn command_name(&self) -> Option<&str> {
        self.get("execute")
            .or_else(|| self.get("exec-oob"))
            .and_then(Value::as_str)
    }

    /// Classify this message for routing.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        if self.contains_key("event") {
            return MessageKind::Event;
        }

        match self.id() {
            Some(Value::String(id)) => MessageKind::Reply { id: id.clone() },
            Some(other) => MessageKind::Reply {
                id: other.to_string(),
            },
            None => MessageKind::Unidentified,
        }
    }

    /// Borrow the underlying JSON object.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Unwrap into the underlying JSON object.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Message {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::protocol(format!(
                "expected a JSON object, got: {other}"
            ))),
        }
    }
}

impl From<Message> for Value {
    fn from(msg: Message) -> Self {
        Value::Object(msg.0)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `Map` always serializes.
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unprintable message>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_event_reply_and_orphan() {
        let ev = Message::parse(r#"{"event": "STOP", "id": "ignored"}"#).unwrap();
        assert_eq!(ev.kind(), MessageKind::Event);

        let reply = Message::parse(r#"{"return": {}, "id": "__req#00003"}"#).unwrap();
        assert_eq!(
            reply.kind(),
            MessageKind::Reply {
                id: "__req#00003".into()
            }
        );

        let numeric = Message::parse(r#"{"return": {}, "id": 7}"#).unwrap();
        assert_eq!(numeric.kind(), MessageKind::Reply { id: "7".into() });

        let orphan = Message::parse(
            r#"{"error": {"class": "GenericError", "desc": "JSON parse error"}}"#,
        )
        .unwrap();
        assert_eq!(orphan.kind(), MessageKind::Unidentified);
    }

    #[test]
    fn non_object_lines_are_rejected() {
        let err = Message::parse("[1, 2, 3]").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);

        let err = Message::parse("{not json").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Json);
    }

    #[test]
    fn command_builder_survives_the_wire() {
        let mut msg = Message::command(
            "blockdev-add",
            Some(json!({"node-name": "disk0", "read-only": true})),
            true,
        );
        msg.insert("id", json!("__req#00042"));

        let parsed = Message::parse(&msg.to_line().unwrap()).unwrap();
        assert_eq!(parsed.get("exec-oob"), Some(&json!("blockdev-add")));
        assert!(!parsed.contains_key("execute"));
        assert_eq!(parsed.get("arguments"), msg.get("arguments"));
        assert_eq!(parsed.id(), Some(&json!("__req#00042")));
        assert_eq!(parsed.command_name(), Some("blockdev-add"));
    }

    #[test]
    fn command_without_arguments_omits_the_member() {
        let msg = Message::command("query-status", None, false);
        assert_eq!(msg.to_line().unwrap(), r#"{"execute":"query-status"}"#);
    }
}
