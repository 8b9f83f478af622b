//! HTTP/SSE transport
//!
//! `POST /sse/relay` opens a `text/event-stream` response fed by a
//! [`ChannelTransport`]; the relay runs in its own task and the response
//! stream ends when that task drops the sender. Trace inspection endpoints
//! sit beside it.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelTransport, OutboundFrame};
use crate::domain::{TraceStatus, TraceSummary};
use crate::protocol::{AgentMessage, EVENT_DONE, EVENT_MESSAGE, ProtocolError, RelayRequest};
use crate::relay::Relay;
use crate::state::TraceQuery;

/// Frames buffered between the relay task and the HTTP body
const STREAM_BUFFER: usize = 64;

/// Most traces returned by `GET /traces`
const TRACE_LIST_LIMIT: usize = 100;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
}

/// Build the HTTP router
pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/sse/relay", post(relay_stream))
        .route("/health", get(health))
        .route("/traces", get(list_traces))
        .route("/traces/:trace_id", get(get_trace))
        .with_state(AppState { relay })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

fn to_event(frame: OutboundFrame) -> Event {
    match frame {
        OutboundFrame::Event { name, data } => Event::default().event(name).data(data.to_string()),
        OutboundFrame::Comment(text) => Event::default().comment(text),
    }
}

async fn relay_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(len = body.len(), "relay_stream: called");
    let (transport, rx) = ChannelTransport::pair(STREAM_BUFFER);
    let auth = bearer_token(&headers);

    // The first frame goes out before any routing so the client sees the
    // connection established immediately
    let _ = transport.sender().try_send(OutboundFrame::Comment("connected".to_string()));

    match serde_json::from_str::<RelayRequest>(&body) {
        Ok(request) => {
            let relay = state.relay.clone();
            tokio::spawn(async move {
                let outcome = relay.handle(request, auth.as_deref(), transport).await;
                debug!(?outcome, "relay_stream: request finished");
            });
        }
        Err(e) => {
            warn!(error = %e, "Malformed relay request body");
            let err = ProtocolError::Malformed(e.to_string());
            let sender = transport.sender();
            let _ = sender.try_send(OutboundFrame::event(
                EVENT_MESSAGE,
                AgentMessage::error("", "", err.to_string()).to_value(),
            ));
            let _ = sender.try_send(OutboundFrame::event(EVENT_DONE, AgentMessage::done("", "").to_value()));
        }
    }

    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(to_event(frame)));
    Sse::new(stream).keep_alive(KeepAlive::new())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct TraceListParams {
    #[serde(default)]
    anomalies: bool,
}

async fn list_traces(State(state): State<AppState>, Query(params): Query<TraceListParams>) -> Response {
    debug!(?params, "list_traces: called");
    let query = TraceQuery {
        status: params.anomalies.then_some(TraceStatus::Anomaly),
        destination_id: None,
        limit: Some(TRACE_LIST_LIMIT),
    };
    match state.relay.state().list_traces(query).await {
        Ok(traces) => {
            let summaries: Vec<TraceSummary> = traces.iter().map(|t| t.summary()).collect();
            info!(count = summaries.len(), "Listed traces");
            Json(summaries).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to list traces");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn get_trace(State(state): State<AppState>, Path(trace_id): Path<String>) -> Response {
    debug!(%trace_id, "get_trace: called");
    match state.relay.state().get_trace(&trace_id).await {
        Ok(Some(trace)) => Json(trace).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "Trace not found" }))).into_response(),
        Err(e) => {
            error!(error = %e, %trace_id, "Failed to load trace");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
