//! Command envelope published to an upstream agent

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{type: "execute", command, params, metadata, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    pub params: CommandParams,
    pub metadata: CommandMetadata,
    /// RFC 3339
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Stream ID; fragments must echo it back
    pub session_id: String,
    pub source: String,
    pub agent_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub trace_id: String,
    /// The client's full message list
    #[serde(default)]
    pub full_messages: Value,
    #[serde(default)]
    pub original_metadata: Value,
}

impl CommandEnvelope {
    /// A chat command for one stream
    pub fn chat(message: impl Into<String>, metadata: CommandMetadata) -> Self {
        Self {
            kind: "execute".to_string(),
            command: "chat".to_string(),
            params: CommandParams {
                message: message.into(),
            },
            metadata,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
