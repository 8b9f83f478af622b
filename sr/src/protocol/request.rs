//! Downstream relay request

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Request rejected before any stream is opened
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Missing required parameters: message_id, agent_id, or message")]
    MissingParameters,

    #[error("Missing Authorization header")]
    MissingAuthorization,

    #[error("Invalid or inactive access key")]
    InvalidAccessKey,

    #[error("Malformed request body: {0}")]
    Malformed(String),
}

/// One chat message in a relay request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub role: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub image_url: Option<String>,
}

impl InboundMessage {
    fn is_user(&self) -> bool {
        self.role.as_deref() == Some("user")
    }

    fn kind_is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }
}

fn present(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

/// Body of `POST /sse/relay`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayRequest {
    /// Stream ID, chosen by the client
    #[serde(default)]
    pub message_id: Option<String>,

    /// Requesting device
    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub message: Vec<InboundMessage>,

    #[serde(default)]
    pub metadata: Value,
}

/// A request with its required fields checked
#[derive(Debug, Clone)]
pub struct ValidRequest<'a> {
    pub message_id: &'a str,
    pub agent_id: &'a str,
}

impl RelayRequest {
    /// Check the required fields
    pub fn validate(&self) -> Result<ValidRequest<'_>, ProtocolError> {
        debug!(message_id = ?self.message_id, agent_id = ?self.agent_id, "RelayRequest::validate: called");
        match (present(&self.message_id), present(&self.agent_id)) {
            (Some(message_id), Some(agent_id)) if !self.message.is_empty() => Ok(ValidRequest { message_id, agent_id }),
            _ => Err(ProtocolError::MissingParameters),
        }
    }

    /// Text of the most recent user message
    ///
    /// Images become `[image]`; `unknown message` when no user message has text.
    pub fn last_user_message(&self) -> String {
        for msg in self.message.iter().rev().filter(|m| m.is_user()) {
            if let Some(content) = present(&msg.content) {
                return content.to_string();
            }
            if msg.kind_is("text")
                && let Some(text) = present(&msg.text)
            {
                return text.to_string();
            }
            if msg.kind_is("image") {
                return "[image]".to_string();
            }
        }
        "unknown message".to_string()
    }

    /// URL of the most recent user image, if any
    pub fn last_image_url(&self) -> Option<&str> {
        self.message
            .iter()
            .rev()
            .find(|m| m.is_user() && m.kind_is("image"))
            .and_then(|m| present(&m.image_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> RelayRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validate_requires_fields() {
        let ok = parse(json!({
            "message_id": "m1",
            "agent_id": "g1",
            "message": [{"role": "user", "content": "hi"}]
        }));
        let valid = ok.validate().unwrap();
        assert_eq!(valid.message_id, "m1");
        assert_eq!(valid.agent_id, "g1");

        let no_messages = parse(json!({"message_id": "m1", "agent_id": "g1", "message": []}));
        assert_eq!(no_messages.validate().unwrap_err(), ProtocolError::MissingParameters);

        let blank_id = parse(json!({"message_id": "", "agent_id": "g1", "message": [{"role": "user"}]}));
        assert!(blank_id.validate().is_err());
    }

    #[test]
    fn test_last_user_message_variants() {
        let req = parse(json!({"message": [
            {"role": "user", "content": "first"},
            {"role": "assistant", "content": "reply"},
            {"role": "user", "type": "text", "text": "second"}
        ]}));
        assert_eq!(req.last_user_message(), "second");

        let image = parse(json!({"message": [
            {"role": "user", "type": "image", "image_url": "https://x/1.jpg"}
        ]}));
        assert_eq!(image.last_user_message(), "[image]");
        assert_eq!(image.last_image_url(), Some("https://x/1.jpg"));

        let none = parse(json!({"message": [{"role": "assistant", "content": "x"}]}));
        assert_eq!(none.last_user_message(), "unknown message");
        assert_eq!(none.last_image_url(), None);
    }

    #[test]
    fn test_empty_text_falls_back_to_earlier_message() {
        let req = parse(json!({"message": [
            {"role": "user", "content": "earlier"},
            {"role": "user", "type": "text", "text": ""}
        ]}));
        assert_eq!(req.last_user_message(), "earlier");
    }
}
