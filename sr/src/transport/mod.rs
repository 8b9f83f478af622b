//! Transport adapters
//!
//! The relay core only needs `write_event` and `closed`. [`ChannelTransport`]
//! feeds an in-process channel (drained by the SSE handler or by tests);
//! [`ObservedTransport`] mirrors every frame onto the observer topic.

mod channel;
pub mod sse;

pub use channel::{ChannelTransport, OutboundFrame};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::bus::EventBus;

/// Outbound write failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Client disconnected")]
    Closed,
}

/// Downstream connection for one stream
#[async_trait]
pub trait Transport: Send {
    /// Write one named event; waits while the client applies backpressure
    async fn write_event(&mut self, name: &str, data: &Value) -> Result<(), TransportError>;

    /// Resolves once the client has gone away
    async fn closed(&mut self);
}

/// Wraps a transport and republishes each written frame on an observer topic
pub struct ObservedTransport<T> {
    inner: T,
    bus: Arc<dyn EventBus>,
    topic: String,
}

impl<T: Transport> ObservedTransport<T> {
    pub fn new(inner: T, bus: Arc<dyn EventBus>, topic: impl Into<String>) -> Self {
        Self {
            inner,
            bus,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for ObservedTransport<T> {
    async fn write_event(&mut self, name: &str, data: &Value) -> Result<(), TransportError> {
        self.inner.write_event(name, data).await?;
        let seen = self.bus.publish(&self.topic, json!({ "event": name, "data": data }));
        debug!(topic = %self.topic, seen, "ObservedTransport::write_event: mirrored");
        Ok(())
    }

    async fn closed(&mut self) {
        self.inner.closed().await
    }
}
