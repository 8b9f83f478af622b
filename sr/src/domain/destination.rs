//! Destination domain type
//!
//! The logical target an upstream agent serves. A destination may be bound to
//! one physical device and one user; requests from either resolve to it.

use relaystore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::id::{generate_agent_token, generate_id};

/// A relay destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Unique identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Secret the upstream agent presents when it connects
    pub agent_token: String,

    /// Device bound through the handshake (unique across destinations)
    #[serde(default)]
    pub bound_device_id: Option<String>,

    /// User bound through the handshake (unique across destinations)
    #[serde(default)]
    pub bound_user_id: Option<String>,

    /// Last time the upstream agent connected or pinged (Unix milliseconds)
    #[serde(default)]
    pub last_seen_at: Option<i64>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Destination {
    /// Create a new unbound destination with a fresh agent token
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(%name, "Destination::new: called");
        let now = now_ms();
        Self {
            id: generate_id("dest", &name),
            name,
            agent_token: generate_agent_token(),
            bound_device_id: None,
            bound_user_id: None,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a destination with a specific ID
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        let mut dest = Self::new(name);
        dest.id = id.into();
        dest
    }

    /// Whether the upstream agent was seen within `window_ms` of `now`
    pub fn is_online(&self, now: i64, window_ms: i64) -> bool {
        match self.last_seen_at {
            Some(seen) => now - seen <= window_ms,
            None => false,
        }
    }

    /// Whether a device or user is already bound here
    pub fn is_bound(&self) -> bool {
        self.bound_device_id.is_some() || self.bound_user_id.is_some()
    }

    /// Record a binding to a device (and optionally a user)
    pub fn bind(&mut self, device_id: &str, user_id: Option<&str>) {
        debug!(dest_id = %self.id, %device_id, ?user_id, "Destination::bind: called");
        self.bound_device_id = Some(device_id.to_string());
        if let Some(user) = user_id {
            self.bound_user_id = Some(user.to_string());
        }
        self.updated_at = now_ms();
    }

    /// Clear both bindings
    pub fn unbind(&mut self) {
        debug!(dest_id = %self.id, "Destination::unbind: called");
        self.bound_device_id = None;
        self.bound_user_id = None;
        self.updated_at = now_ms();
    }

    /// Mark the upstream agent as seen now
    pub fn touch(&mut self, now: i64) {
        self.last_seen_at = Some(now);
        self.updated_at = now;
    }
}

impl Record for Destination {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "destinations"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("agent_token".to_string(), IndexValue::String(self.agent_token.clone()));
        if let Some(ref device) = self.bound_device_id {
            fields.insert("bound_device_id".to_string(), IndexValue::String(device.clone()));
        }
        if let Some(ref user) = self.bound_user_id {
            fields.insert("bound_user_id".to_string(), IndexValue::String(user.clone()));
        }
        fields
    }
}
