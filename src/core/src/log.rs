//! Build log record types.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single record from the Docker engine's build output (JSON lines).
///
/// Only `stream` is interpreted; every other field (`aux`, `error`,
/// `errorDetail`, `progressDetail`, ...) is kept as-is so the record can be
/// re-emitted without loss.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildLogRecord {
    /// Text written by the build, usually one line including its trailing newline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    /// Unrecognized fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BuildLogRecord {
    /// Create a record carrying only a `stream` text.
    pub fn from_stream(text: impl Into<String>) -> Self {
        Self {
            stream: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }

    /// Parse one JSON line.
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Serialize to a single JSON line (without trailing newline).
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
