//! Agent link message types
//!
//! JSON-over-newline protocol. Each frame is a single line of JSON followed
//! by `\n`. Besides the control frames below, the agent sends fragment events
//! (`stream_chunk`, `stream_end`, `stream_error`, `stream_summary`) and the
//! relay forwards command envelopes (`type: "execute"`) verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::FragmentEvent;

/// Control frames from an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentControl {
    /// Must be the first frame on a connection
    Connect { agent_token: String },

    /// Keepalive; refreshes the destination's presence
    Ping,
}

/// Replies from the relay to an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkResponse {
    /// Connection authenticated
    Connected { destination_id: String },

    /// Pong response to ping
    Pong,

    /// Error response
    Error { message: String },
}

impl LinkResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// A parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    Control(AgentControl),
    /// Fragment event plus the raw payload to publish
    Fragment(FragmentEvent, Value),
}

impl AgentFrame {
    /// Parse one line; `Err` carries a message suitable for an error frame
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(line).map_err(|e| format!("Invalid JSON: {}", e))?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        if kind.starts_with("stream_") {
            return FragmentEvent::from_value(value.clone())
                .map(|event| Self::Fragment(event, value))
                .ok_or_else(|| format!("Invalid {} frame", kind));
        }
        serde_json::from_value(value)
            .map(Self::Control)
            .map_err(|_| format!("Unknown frame type: {:?}", kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_deserialize() {
        let json = r#"{"type":"connect","agent_token":"tok-1"}"#;
        let frame = AgentFrame::parse(json).unwrap();
        assert_eq!(
            frame,
            AgentFrame::Control(AgentControl::Connect {
                agent_token: "tok-1".to_string()
            })
        );
    }

    #[test]
    fn test_ping_deserialize() {
        let frame = AgentFrame::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, AgentFrame::Control(AgentControl::Ping));
    }

    #[test]
    fn test_fragment_keeps_raw_payload() {
        let json = r#"{"type":"stream_chunk","content":"Hel","sequence":0,"session_id":"m1","extra":1}"#;
        let AgentFrame::Fragment(event, raw) = AgentFrame::parse(json).unwrap() else {
            panic!("expected fragment");
        };
        assert_eq!(event.session_id(), Some("m1"));
        assert_eq!(raw["extra"], 1);
    }

    #[test]
    fn test_unknown_and_invalid_frames() {
        assert!(AgentFrame::parse("not json").unwrap_err().starts_with("Invalid JSON"));
        assert!(AgentFrame::parse(r#"{"type":"reboot"}"#).unwrap_err().contains("reboot"));
        assert_eq!(
            AgentFrame::parse(r#"{"type":"stream_chunk","sequence":"x"}"#).unwrap_err(),
            "Invalid stream_chunk frame"
        );
    }

    #[test]
    fn test_response_serialize() {
        let json = serde_json::to_string(&LinkResponse::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let json = serde_json::to_string(&LinkResponse::Connected {
            destination_id: "d1".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"connected","destination_id":"d1"}"#);

        let json = serde_json::to_string(&LinkResponse::error("Unknown agent token")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"Unknown agent token"}"#);
    }
}
