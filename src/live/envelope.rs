use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast after a settled change in the watched directory.
pub const FILE_CHANGED: &str = "file:changed";

/// Broadcast after a successful mutating command.
pub const ISSUES_CHANGED: &str = "issues:changed";

/// The only unit sent over the live channel: `{"type": ..., "payload": ...}`.
///
/// The payload is opaque to the server; only receivers interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Parse a text frame. Anything that is not a JSON object with a string
    /// `type` yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn file_changed(path: &str) -> Self {
        Self::new(FILE_CHANGED, serde_json::json!({ "path": path }))
    }

    pub fn issues_changed(payload: Value) -> Self {
        Self::new(ISSUES_CHANGED, payload)
    }
}
