//! Domain types for StreamRelay
//!
//! Persistent records: Destination, BindingToken, TraceRecord.
//! All implement the Record trait for RelayStore persistence.

mod destination;
mod id;
mod token;
mod trace;

pub use destination::Destination;
pub use id::{generate_agent_token, generate_binding_token, generate_id, generate_trace_id};
pub use token::BindingToken;
pub use trace::{
    AnomalyKind, AnomalyReport, LossPosition, TraceEvent, TraceEventType, TraceRecord, TraceStatus, TraceSummary,
};

// Re-export relaystore types for convenience
pub use relaystore::{Filter, FilterOp, IndexValue, Record, Store, now_ms};
