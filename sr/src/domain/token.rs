//! BindingToken domain type
//!
//! A short-lived, single-use secret that lets a device claim a destination.
//! The token string itself is the record ID.

use relaystore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::id::generate_binding_token;
use crate::binding::BindingError;

/// Single-use binding token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingToken {
    /// The random token (also the record ID)
    pub token: String,

    /// Destination this token binds to
    pub destination_id: String,

    /// Expiry (Unix milliseconds)
    pub expires_at: i64,

    /// When the token was consumed, if ever
    #[serde(default)]
    pub used_at: Option<i64>,

    /// Device that consumed the token
    #[serde(default)]
    pub bound_device_id: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl BindingToken {
    /// Issue a fresh token for a destination, valid for `ttl_ms`
    pub fn issue(destination_id: impl Into<String>, ttl_ms: i64) -> Self {
        Self::issue_at(destination_id, now_ms(), ttl_ms)
    }

    /// Issue a token as of `now`
    pub fn issue_at(destination_id: impl Into<String>, now: i64, ttl_ms: i64) -> Self {
        let destination_id = destination_id.into();
        debug!(%destination_id, now, ttl_ms, "BindingToken::issue_at: called");
        Self {
            token: generate_binding_token(),
            destination_id,
            expires_at: now + ttl_ms,
            used_at: None,
            bound_device_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    /// Valid iff unused and not yet expired
    pub fn valid_for_binding(&self, now: i64) -> bool {
        !self.is_used() && !self.is_expired(now)
    }

    /// The reason this token cannot bind, if any
    pub fn check(&self, now: i64) -> Result<(), BindingError> {
        if self.is_used() {
            return Err(BindingError::TokenAlreadyUsed);
        }
        if self.is_expired(now) {
            return Err(BindingError::TokenExpired);
        }
        Ok(())
    }

    /// Consume the token for `device_id`; succeeds at most once
    pub fn mark_used(&mut self, device_id: &str, now: i64) -> Result<(), BindingError> {
        debug!(token = %self.token, %device_id, "BindingToken::mark_used: called");
        self.check(now)?;
        self.used_at = Some(now);
        self.bound_device_id = Some(device_id.to_string());
        self.updated_at = now;
        Ok(())
    }
}

impl Record for BindingToken {
    fn id(&self) -> &str {
        &self.token
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "binding_tokens"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "destination_id".to_string(),
            IndexValue::String(self.destination_id.clone()),
        );
        fields.insert("used".to_string(), IndexValue::Bool(self.is_used()));
        fields.insert("expires_at".to_string(), IndexValue::Int(self.expires_at));
        fields
    }
}
