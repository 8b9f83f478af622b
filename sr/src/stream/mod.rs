//! Per-stream relay core
//!
//! A stream is owned by exactly one task. The reassembler orders fragments,
//! the monitor decides when the stream is over, the compensator reconciles
//! the final summary, and the session loop ties them to a bus subscription
//! and a downstream transport.

mod compensator;
mod monitor;
mod reassembler;
mod session;

pub use compensator::{Compensator, LossThresholds, Reconciliation, StreamSummary, content_hash};
pub use monitor::{IdleMonitor, StreamState};
pub use reassembler::{Ingest, Reassembler, Released};
pub use session::{SessionOutcome, SessionSettings, StreamSession};
