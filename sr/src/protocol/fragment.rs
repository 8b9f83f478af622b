//! Fragment events published by upstream agents

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event on a stream topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FragmentEvent {
    StreamChunk {
        #[serde(default)]
        content: Option<String>,
        /// Absent for unordered legacy senders
        #[serde(default)]
        sequence: Option<u64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    StreamEnd {
        #[serde(default)]
        session_id: Option<String>,
    },
    StreamError {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    StreamSummary {
        #[serde(default)]
        total_content: String,
        #[serde(default)]
        total_chunks: u64,
        #[serde(default)]
        content_hash: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl FragmentEvent {
    /// Parse a bus payload; `None` for anything that is not a fragment event
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::StreamChunk { session_id, .. }
            | Self::StreamEnd { session_id }
            | Self::StreamError { session_id, .. }
            | Self::StreamSummary { session_id, .. } => session_id.as_deref(),
        }
    }

    /// Whether this event belongs to `stream_id`; events without a session ID are accepted
    pub fn belongs_to(&self, stream_id: &str) -> bool {
        self.session_id().is_none_or(|s| s == stream_id)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StreamChunk { .. } => "stream_chunk",
            Self::StreamEnd { .. } => "stream_end",
            Self::StreamError { .. } => "stream_error",
            Self::StreamSummary { .. } => "stream_summary",
        }
    }
}
