use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    message::Message,
};

/// Capability that enables out-of-band execution.
pub const CAPABILITY_OOB: &str = "oob";

/// QMP greeting message.
///
/// QMP sends this as the very first JSON object after the socket is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// QMP meta information.
    #[serde(rename = "QMP")]
    pub qmp: QmpInfo,
}

impl Greeting {
    /// Interpret a received message as a greeting.
    pub fn from_message(msg: &Message) -> Result<Self> {
        serde_json::from_value(msg.clone().into()).map_err(Error::from)
    }

    /// Whether the server advertised `capability`.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.qmp.capabilities.iter().any(|c| c == capability)
    }

    /// Whether the server supports `exec-oob`.
    #[must_use]
    pub fn supports_oob(&self) -> bool {
        self.has_capability(CAPABILITY_OOB)
    }
}

/// `QMP` section in the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpInfo {
    /// Server version, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<QmpVersion>,

    /// Supported capabilities.
    pub capabilities: Vec<String>,
}

/// QEMU version information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersion {
    /// QEMU package version.
    pub qemu: QmpVersionNumber,

    /// Package string (when available).
    #[serde(default)]
    pub package: String,
}

/// Numeric version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersionNumber {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Micro version.
    pub micro: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_greeting_parses() {
        let msg = Message::parse(r#"{"QMP": {"capabilities": []}}"#).unwrap();
        let greeting = Greeting::from_message(&msg).unwrap();
        assert!(greeting.qmp.version.is_none());
        assert!(!greeting.supports_oob());
    }

    #[test]
    fn full_greeting_parses() {
        let msg = Message::parse(
            r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8},
                "package": "v8.2.0"}, "capabilities": ["oob"]}}"#,
        )
        .unwrap();
        let greeting = Greeting::from_message(&msg).unwrap();
        assert!(greeting.supports_oob());
        assert_eq!(greeting.qmp.version.unwrap().qemu.minor, 2);
    }

    #[test]
    fn capabilities_are_required() {
        let msg = Message::parse(r#"{"QMP": {}}"#).unwrap();
        assert!(Greeting::from_message(&msg).is_err());

        let msg = Message::parse(r#"{"QMP": {"capabilities": "oob"}}"#).unwrap();
        assert!(Greeting::from_message(&msg).is_err());
    }
}
