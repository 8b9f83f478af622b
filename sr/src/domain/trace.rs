//! TraceRecord domain type
//!
//! A persistent, append-only timeline of one relayed stream plus the derived
//! loss and timing analysis.

use relaystore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use super::id::generate_trace_id;

/// Trace lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Created, command not yet dispatched
    #[default]
    Pending,
    /// Command dispatched, stream in flight
    Active,
    /// Finished without anomalies
    Completed,
    /// Finished with loss, timeout, duplicate delivery or upstream error
    Anomaly,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of events on a trace timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    RequestReceived,
    CommandDispatched,
    FragmentReceived,
    FragmentDelivered,
    StreamEnd,
    SummaryReceived,
    AnomalyDetected,
    CompensationSent,
    StreamError,
    IdleTimeout,
    ClientClosed,
    DuplicateDropped,
    BusLagged,
}

impl fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RequestReceived => "request_received",
            Self::CommandDispatched => "command_dispatched",
            Self::FragmentReceived => "fragment_received",
            Self::FragmentDelivered => "fragment_delivered",
            Self::StreamEnd => "stream_end",
            Self::SummaryReceived => "summary_received",
            Self::AnomalyDetected => "anomaly_detected",
            Self::CompensationSent => "compensation_sent",
            Self::StreamError => "stream_error",
            Self::IdleTimeout => "idle_timeout",
            Self::ClientClosed => "client_closed",
            Self::DuplicateDropped => "duplicate_dropped",
            Self::BusLagged => "bus_lagged",
        };
        f.write_str(s)
    }
}

/// One timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: TraceEventType,
    pub data: Value,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Position of lost fragments within the sequence range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossPosition {
    Head,
    Middle,
    Tail,
    Mixed,
}

impl fmt::Display for LossPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Head => "head",
            Self::Middle => "middle",
            Self::Tail => "tail",
            Self::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

/// Classified anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ChunkCountMismatch,
    ContentLengthMismatch,
    DuplicateDelivery,
    IdleTimeout,
    UpstreamError,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ChunkCountMismatch => "chunk_count_mismatch",
            Self::ContentLengthMismatch => "content_length_mismatch",
            Self::DuplicateDelivery => "duplicate_delivery",
            Self::IdleTimeout => "idle_timeout",
            Self::UpstreamError => "upstream_error",
        };
        f.write_str(s)
    }
}

/// Structured anomaly report stored on the trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub kind: AnomalyKind,
    pub upstream_fragments: u64,
    pub downstream_fragments: u64,
    pub upstream_length: u64,
    pub downstream_length: u64,
    pub fragment_gap: i64,
    pub content_gap: i64,
    pub detected_at: i64,
}

/// Persistent record of one relayed stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Unique trace ID
    pub id: String,

    /// Client-supplied stream (message) ID
    pub stream_id: String,

    /// Destination the command was dispatched to
    pub destination_id: String,

    /// Requesting device
    #[serde(default)]
    pub agent_id: Option<String>,

    pub status: TraceStatus,

    pub events: Vec<TraceEvent>,

    /// Every fragment's content as received, in arrival order
    pub upstream_content: String,

    /// Everything written downstream, compensation included
    pub downstream_content: String,

    pub upstream_fragment_count: u64,
    pub downstream_fragment_count: u64,

    /// Fragment total reported by the upstream summary
    #[serde(default)]
    pub upstream_total_fragments: Option<u64>,

    pub missing_sequences: Vec<u64>,

    #[serde(default)]
    pub loss_position: Option<LossPosition>,

    #[serde(default)]
    pub first_fragment_delay_ms: Option<u64>,

    #[serde(default)]
    pub avg_fragment_interval_ms: Option<f64>,

    #[serde(default)]
    pub last_fragment_delay_ms: Option<u64>,

    #[serde(default)]
    pub anomaly: Option<AnomalyReport>,

    /// Whether the summary hash matched the received content
    #[serde(default)]
    pub content_hash_match: Option<bool>,

    /// Whether a compensating fragment was sent
    #[serde(default)]
    pub compensated: bool,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl TraceRecord {
    /// Create a pending trace for a stream
    pub fn new(stream_id: impl Into<String>, destination_id: impl Into<String>, agent_id: Option<String>) -> Self {
        let stream_id = stream_id.into();
        let destination_id = destination_id.into();
        debug!(%stream_id, %destination_id, "TraceRecord::new: called");
        let now = now_ms();
        Self {
            id: generate_trace_id(),
            stream_id,
            destination_id,
            agent_id,
            status: TraceStatus::Pending,
            events: Vec::new(),
            upstream_content: String::new(),
            downstream_content: String::new(),
            upstream_fragment_count: 0,
            downstream_fragment_count: 0,
            upstream_total_fragments: None,
            missing_sequences: Vec::new(),
            loss_position: None,
            first_fragment_delay_ms: None,
            avg_fragment_interval_ms: None,
            last_fragment_delay_ms: None,
            anomaly: None,
            content_hash_match: None,
            compensated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a timeline event
    pub fn push_event(&mut self, event_type: TraceEventType, data: Value) {
        let now = now_ms();
        self.events.push(TraceEvent {
            event_type,
            data,
            timestamp: now,
        });
        self.updated_at = now;
    }

    /// Count of events of one type
    pub fn count_events(&self, event_type: TraceEventType) -> usize {
        self.events.iter().filter(|e| e.event_type == event_type).count()
    }

    /// Upstream length in characters
    pub fn upstream_length(&self) -> u64 {
        self.upstream_content.chars().count() as u64
    }

    /// Downstream length in characters
    pub fn downstream_length(&self) -> u64 {
        self.downstream_content.chars().count() as u64
    }

    pub fn is_anomaly(&self) -> bool {
        self.status == TraceStatus::Anomaly
    }

    /// Export view without the event timeline or content bodies
    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            trace_id: self.id.clone(),
            message_id: self.stream_id.clone(),
            destination_id: self.destination_id.clone(),
            status: self.status,
            upstream_fragment_count: self.upstream_fragment_count,
            downstream_fragment_count: self.downstream_fragment_count,
            upstream_length: self.upstream_length(),
            downstream_length: self.downstream_length(),
            missing_sequences: self.missing_sequences.clone(),
            loss_position: self.loss_position,
            first_fragment_delay_ms: self.first_fragment_delay_ms,
            avg_fragment_interval_ms: self.avg_fragment_interval_ms,
            last_fragment_delay_ms: self.last_fragment_delay_ms,
            anomaly_kind: self.anomaly.as_ref().map(|a| a.kind),
            created_at: self.created_at,
        }
    }
}

impl Record for TraceRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "traces"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("stream_id".to_string(), IndexValue::String(self.stream_id.clone()));
        fields.insert(
            "destination_id".to_string(),
            IndexValue::String(self.destination_id.clone()),
        );
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}

/// Flat export of a trace, used by the `/traces` endpoint and `sr trace list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub message_id: String,
    pub destination_id: String,
    pub status: TraceStatus,
    pub upstream_fragment_count: u64,
    pub downstream_fragment_count: u64,
    pub upstream_length: u64,
    pub downstream_length: u64,
    pub missing_sequences: Vec<u64>,
    pub loss_position: Option<LossPosition>,
    pub first_fragment_delay_ms: Option<u64>,
    pub avg_fragment_interval_ms: Option<f64>,
    pub last_fragment_delay_ms: Option<u64>,
    pub anomaly_kind: Option<AnomalyKind>,
    pub created_at: i64,
}
