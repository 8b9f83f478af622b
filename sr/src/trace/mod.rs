//! Trace recording and anomaly analysis
//!
//! Every relayed stream gets a persistent [`TraceRecord`](crate::domain::TraceRecord)
//! timeline. The recorder fills it while the stream runs; analysis classifies
//! loss (head/middle/tail/mixed) and timing once it ends.

mod analysis;
mod recorder;

pub use analysis::{TimingStats, detect_anomaly, loss_position, missing_sequences};
pub use recorder::TraceRecorder;
