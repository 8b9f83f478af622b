//! Channel-backed transport

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Transport, TransportError};

/// A frame bound for the client
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Named event with a JSON payload
    Event { name: String, data: Value },
    /// Comment line, ignored by clients
    Comment(String),
}

impl OutboundFrame {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            name: name.into(),
            data,
        }
    }

    /// Event name, `None` for comments
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Event { name, .. } => Some(name),
            Self::Comment(_) => None,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Event { data, .. } => Some(data),
            Self::Comment(_) => None,
        }
    }
}

/// Transport writing into a bounded channel; a full channel is backpressure
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundFrame>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end the client side drains
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        debug!(capacity, "ChannelTransport::pair: called");
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Raw sender, for frames written outside the [`Transport`] contract
    pub fn sender(&self) -> &mpsc::Sender<OutboundFrame> {
        &self.tx
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write_event(&mut self, name: &str, data: &Value) -> Result<(), TransportError> {
        self.tx
            .send(OutboundFrame::event(name, data.clone()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn closed(&mut self) {
        self.tx.closed().await
    }
}
