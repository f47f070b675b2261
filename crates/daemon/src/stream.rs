//! Stream identity and lifecycle status.

use crate::error::PreconditionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated stream identifier, restricted to `[A-Za-z0-9_-]+`.
///
/// The id doubles as a directory name under the uploads root and as a
/// prefix for transient manifest files, so the character set is closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    pub fn parse(raw: &str) -> Result<Self, PreconditionError> {
        if is_valid_stream_id(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(PreconditionError::InvalidStreamId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks the `[A-Za-z0-9_-]+` constraint.
pub fn is_valid_stream_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StreamId {
    type Error = PreconditionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// Externally visible lifecycle status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Registered, never started.
    Created,
    /// The transcoder reported that it is running.
    Streaming,
    /// Stopped by request or the transcoder ended cleanly.
    Stopped,
    /// The transcoder failed to launch or exited abnormally.
    Error,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Created => "created",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Stopped => "stopped",
            StreamStatus::Error => "error",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
