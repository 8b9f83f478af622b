//! Frames written to the downstream client
//!
//! Two named event kinds: `message` carries content or a tool call, `done`
//! closes the exchange.

use serde::{Deserialize, Serialize};

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_DONE: &str = "done";

/// Device-side action requested by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub command: String,
}

/// Payload of a `message` or `done` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: String,

    /// `answer`, `tool_call` or `error`
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_stream: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,

    /// Error text for `type: "error"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub message_id: String,
    pub agent_id: String,
    pub is_finish: bool,
}

impl AgentMessage {
    fn base(kind: &str, message_id: &str, agent_id: &str, is_finish: bool) -> Self {
        Self {
            role: "agent".to_string(),
            kind: kind.to_string(),
            answer_stream: None,
            tool_call: None,
            message: None,
            message_id: message_id.to_string(),
            agent_id: agent_id.to_string(),
            is_finish,
        }
    }

    /// An answer fragment
    pub fn answer(message_id: &str, agent_id: &str, text: impl Into<String>, is_finish: bool) -> Self {
        let mut msg = Self::base("answer", message_id, agent_id, is_finish);
        msg.answer_stream = Some(text.into());
        msg
    }

    /// Ask the device to run a command (e.g. `take_photo`)
    pub fn tool_call(message_id: &str, agent_id: &str, command: &str) -> Self {
        let mut msg = Self::base("tool_call", message_id, agent_id, false);
        msg.tool_call = Some(ToolCall {
            command: command.to_string(),
        });
        msg
    }

    /// A terminal protocol error
    pub fn error(message_id: &str, agent_id: &str, text: impl Into<String>) -> Self {
        let mut msg = Self::base("error", message_id, agent_id, true);
        msg.message = Some(text.into());
        msg
    }

    /// Payload of the closing `done` event
    pub fn done(message_id: &str, agent_id: &str) -> Self {
        Self::base("answer", message_id, agent_id, true)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_answer_shape() {
        let value = AgentMessage::answer("m1", "g1", "Hel", false).to_value();
        assert_eq!(
            value,
            json!({
                "role": "agent",
                "type": "answer",
                "answer_stream": "Hel",
                "message_id": "m1",
                "agent_id": "g1",
                "is_finish": false
            })
        );
    }

    #[test]
    fn test_done_has_no_answer_stream() {
        let value = AgentMessage::done("m1", "g1").to_value();
        assert!(value.get("answer_stream").is_none());
        assert_eq!(value["is_finish"], true);
        assert_eq!(value["type"], "answer");
    }

    #[test]
    fn test_tool_call_and_error() {
        let call = AgentMessage::tool_call("m1", "g1", "take_photo").to_value();
        assert_eq!(call["type"], "tool_call");
        assert_eq!(call["tool_call"]["command"], "take_photo");
        assert_eq!(call["is_finish"], false);

        let err = AgentMessage::error("m1", "g1", "bad").to_value();
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "bad");
        assert_eq!(err["is_finish"], true);
    }
}
