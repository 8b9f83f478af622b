//! Relay - entry point for one downstream request
//!
//! Validates and authenticates the request, routes it to the binding
//! handshake or to the bound destination, dispatches the command on the bus
//! and hands the stream to a [`StreamSession`].

use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::binding::{BindingHandshake, BindingOutcome};
use crate::bus::{EventBus, topics};
use crate::config::Config;
use crate::domain::{Destination, TraceRecord, now_ms};
use crate::protocol::{
    AgentMessage, CommandEnvelope, CommandMetadata, EVENT_DONE, EVENT_MESSAGE, ProtocolError, RelayRequest,
};
use crate::state::StateManager;
use crate::stream::{SessionOutcome, SessionSettings, StreamSession};
use crate::trace::TraceRecorder;
use crate::transport::{ObservedTransport, Transport, TransportError};

/// Value of `metadata.source` on dispatched commands
pub const COMMAND_SOURCE: &str = "streamrelay";

pub const OFFLINE_MESSAGE: &str = "Destination is offline. Check the agent connection and try again.";

pub const LOOKUP_FAILED_MESSAGE: &str = "Service temporarily unavailable. Please try again later.";

/// What happened to a request
#[derive(Debug)]
pub enum RelayOutcome {
    /// Rejected before routing
    Rejected(ProtocolError),
    /// No destination bound; the device was asked for a photo
    BindingOffered,
    /// A binding photo was processed
    Binding(BindingOutcome),
    /// Destination resolved but its agent is not connected
    Offline(String),
    /// The destination could not be looked up
    Unavailable,
    /// Stream ran to a terminal state
    Streamed(SessionOutcome),
    /// The client went away before the stream started
    Disconnected,
}

/// Routing knobs taken from [`Config`]
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub session: SessionSettings,
    /// Empty disables the bearer check
    pub access_keys: Vec<String>,
    /// 0 disables the offline check
    pub presence_window_ms: i64,
    pub observer: bool,
}

impl RelayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: config.session_settings(),
            access_keys: config.server.access_keys.clone(),
            presence_window_ms: config.agent_link.presence_window_ms(),
            observer: config.relay.observer,
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Shared relay service; cheap to clone
#[derive(Clone)]
pub struct Relay {
    state: StateManager,
    bus: Arc<dyn EventBus>,
    handshake: BindingHandshake,
    options: Arc<RelayOptions>,
}

impl Relay {
    pub fn new(state: StateManager, bus: Arc<dyn EventBus>, handshake: BindingHandshake, options: RelayOptions) -> Self {
        Self {
            state,
            bus,
            handshake,
            options: Arc::new(options),
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    fn authorize(&self, auth: Option<&str>) -> Result<(), ProtocolError> {
        if self.options.access_keys.is_empty() {
            return Ok(());
        }
        let key = auth.filter(|k| !k.is_empty()).ok_or(ProtocolError::MissingAuthorization)?;
        if self.options.access_keys.iter().any(|k| k == key) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidAccessKey)
        }
    }

    /// Serve one request over `transport`
    pub async fn handle<T: Transport>(&self, request: RelayRequest, auth: Option<&str>, mut transport: T) -> RelayOutcome {
        debug!(message_id = ?request.message_id, agent_id = ?request.agent_id, "handle: called");

        let checked = request.validate().and_then(|valid| self.authorize(auth).map(|_| valid));
        let valid = match checked {
            Ok(valid) => valid,
            Err(e) => {
                warn!(error = %e, "Rejecting relay request");
                let mid = request.message_id.as_deref().unwrap_or_default();
                let aid = request.agent_id.as_deref().unwrap_or_default();
                let _ = write_terminal(&mut transport, mid, aid, AgentMessage::error(mid, aid, e.to_string())).await;
                return RelayOutcome::Rejected(e);
            }
        };
        let stream_id = valid.message_id;
        let device_id = valid.agent_id;
        let user_id = request.user_id.as_deref().filter(|u| !u.is_empty());

        if self.handshake.is_awaiting(stream_id, device_id)
            && let Some(image_url) = request.last_image_url()
        {
            info!(%stream_id, %device_id, "Received binding photo");
            return match self
                .handshake
                .resolve(&mut transport, stream_id, device_id, user_id, image_url)
                .await
            {
                Ok(outcome) => RelayOutcome::Binding(outcome),
                Err(_) => RelayOutcome::Disconnected,
            };
        }

        let dest = match self.state.find_destination(user_id, Some(device_id)).await {
            Ok(Some(dest)) => dest,
            Ok(None) => {
                return match self.handshake.offer(&mut transport, stream_id, device_id).await {
                    Ok(()) => RelayOutcome::BindingOffered,
                    Err(_) => RelayOutcome::Disconnected,
                };
            }
            Err(e) => {
                warn!(error = %e, %stream_id, "Destination lookup failed");
                let msg = AgentMessage::answer(stream_id, device_id, LOOKUP_FAILED_MESSAGE, true);
                let _ = write_terminal(&mut transport, stream_id, device_id, msg).await;
                return RelayOutcome::Unavailable;
            }
        };
        info!(dest_id = %dest.id, %stream_id, "Resolved destination");

        if self.options.presence_window_ms > 0 && !dest.is_online(now_ms(), self.options.presence_window_ms) {
            warn!(dest_id = %dest.id, last_seen_at = ?dest.last_seen_at, "Destination is offline");
            let msg = AgentMessage::answer(stream_id, device_id, OFFLINE_MESSAGE, true);
            let _ = write_terminal(&mut transport, stream_id, device_id, msg).await;
            return RelayOutcome::Offline(dest.id);
        }

        let outcome = if self.options.observer {
            let observed = ObservedTransport::new(transport, self.bus.clone(), topics::observer(&dest.id));
            self.dispatch(&request, &dest, stream_id, device_id, user_id, observed).await
        } else {
            self.dispatch(&request, &dest, stream_id, device_id, user_id, transport).await
        };
        RelayOutcome::Streamed(outcome)
    }

    /// Open the trace, subscribe, publish the command and run the session
    async fn dispatch<T: Transport>(
        &self,
        request: &RelayRequest,
        dest: &Destination,
        stream_id: &str,
        device_id: &str,
        user_id: Option<&str>,
        transport: T,
    ) -> SessionOutcome {
        debug!(dest_id = %dest.id, %stream_id, "dispatch: called");
        let settings = self.options.session;

        let trace = TraceRecord::new(stream_id, &dest.id, Some(device_id.to_string()));
        let mut recorder = TraceRecorder::new(trace, self.state.clone(), settings.thresholds, Instant::now());
        recorder.request_received(json!({
            "message_id": stream_id,
            "agent_id": device_id,
            "user_id": user_id,
            "destination_id": dest.id,
        }));

        // Subscribe first so no fragment can be published before we listen
        let subscription = self.bus.subscribe(&topics::stream(&dest.id, stream_id));

        let envelope = CommandEnvelope::chat(
            request.last_user_message(),
            CommandMetadata {
                session_id: stream_id.to_string(),
                source: COMMAND_SOURCE.to_string(),
                agent_id: device_id.to_string(),
                user_id: user_id.map(str::to_string),
                trace_id: recorder.trace_id().to_string(),
                full_messages: serde_json::to_value(&request.message).unwrap_or_default(),
                original_metadata: request.metadata.clone(),
            },
        );
        let topic = topics::commands(&dest.id);
        let subscribers = self
            .bus
            .publish(&topic, serde_json::to_value(&envelope).unwrap_or_default());
        info!(%topic, subscribers, trace_id = %recorder.trace_id(), "Dispatched command");
        if subscribers == 0 {
            warn!(%topic, "No agent subscribed to command topic");
        }
        recorder.command_dispatched(&topic, subscribers);
        recorder.flush().await;

        StreamSession::new(stream_id, device_id, self.bus.clone(), subscription, transport, recorder, settings)
            .run()
            .await
    }
}

async fn write_terminal<T: Transport>(
    transport: &mut T,
    message_id: &str,
    agent_id: &str,
    msg: AgentMessage,
) -> Result<(), TransportError> {
    transport.write_event(EVENT_MESSAGE, &msg.to_value()).await?;
    transport
        .write_event(EVENT_DONE, &AgentMessage::done(message_id, agent_id).to_value())
        .await
}
