//! Trace recorder - observes every event of one stream
//!
//! Owned by the stream's task. Event methods mutate the in-memory trace;
//! `flush` persists it through the StateManager. Persistence failures are
//! logged and never end the stream.

use std::collections::BTreeSet;

use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::analysis::{TimingStats, detect_anomaly, loss_position, missing_sequences};
use crate::domain::{AnomalyKind, AnomalyReport, TraceEventType, TraceRecord, TraceStatus, now_ms};
use crate::state::StateManager;
use crate::stream::{LossThresholds, Reconciliation, StreamSummary};

const PREVIEW_CHARS: usize = 50;

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

/// Records the timeline and derived analysis for one stream
pub struct TraceRecorder {
    trace: TraceRecord,
    state: StateManager,
    thresholds: LossThresholds,
    started_at: Instant,
    last_fragment_at: Option<Instant>,
    timing: TimingStats,
    delivered: BTreeSet<u64>,
    max_seen: Option<u64>,
    last_kind: Option<AnomalyKind>,
    reconciliation: Option<Reconciliation>,
    timed_out: bool,
    upstream_error: bool,
}

impl TraceRecorder {
    pub fn new(trace: TraceRecord, state: StateManager, thresholds: LossThresholds, started_at: Instant) -> Self {
        debug!(trace_id = %trace.id, "TraceRecorder::new: called");
        Self {
            trace,
            state,
            thresholds,
            started_at,
            last_fragment_at: None,
            timing: TimingStats::default(),
            delivered: BTreeSet::new(),
            max_seen: None,
            last_kind: None,
            reconciliation: None,
            timed_out: false,
            upstream_error: false,
        }
    }

    pub fn trace(&self) -> &TraceRecord {
        &self.trace
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.id
    }

    /// Persist the current state of the trace
    pub async fn flush(&self) {
        if let Err(e) = self.state.save_trace(self.trace.clone()).await {
            error!(trace_id = %self.trace.id, error = %e, "Failed to persist trace");
        }
    }

    pub fn request_received(&mut self, data: Value) {
        self.trace.push_event(TraceEventType::RequestReceived, data);
    }

    pub fn command_dispatched(&mut self, topic: &str, subscribers: usize) {
        self.trace.status = TraceStatus::Active;
        self.trace.push_event(
            TraceEventType::CommandDispatched,
            json!({ "topic": topic, "subscribers": subscribers }),
        );
    }

    /// An upstream fragment arrived (before reassembly)
    pub fn fragment_received(&mut self, sequence: Option<u64>, content: &str, now: Instant) {
        self.trace.upstream_fragment_count += 1;
        self.trace.upstream_content.push_str(content);
        if let Some(seq) = sequence {
            self.max_seen = Some(self.max_seen.map_or(seq, |m| m.max(seq)));
        }

        let since_previous = self.last_fragment_at.map(|prev| now.saturating_duration_since(prev));
        self.timing
            .fragment(now.saturating_duration_since(self.started_at), since_previous);
        self.last_fragment_at = Some(now);

        self.trace.push_event(
            TraceEventType::FragmentReceived,
            json!({
                "sequence": sequence,
                "content_preview": preview(content),
                "content_length": content.chars().count(),
                "total_upstream_fragments": self.trace.upstream_fragment_count,
            }),
        );
    }

    /// A fragment was written downstream in order
    pub fn fragment_delivered(&mut self, sequence: Option<u64>, content: &str) {
        self.trace.downstream_fragment_count += 1;
        self.trace.downstream_content.push_str(content);
        if let Some(seq) = sequence {
            self.delivered.insert(seq);
        }
        self.trace.push_event(
            TraceEventType::FragmentDelivered,
            json!({
                "sequence": sequence,
                "content_length": content.chars().count(),
                "total_downstream_fragments": self.trace.downstream_fragment_count,
            }),
        );
    }

    /// An empty fragment advanced the sequence without a downstream write
    pub fn fragment_skipped(&mut self, sequence: Option<u64>) {
        if let Some(seq) = sequence {
            self.delivered.insert(seq);
        }
    }

    pub fn duplicate_dropped(&mut self, sequence: Option<u64>) {
        self.trace
            .push_event(TraceEventType::DuplicateDropped, json!({ "sequence": sequence }));
    }

    pub fn stream_end(&mut self, next_expected: u64, now: Instant) {
        if let Some(last) = self.last_fragment_at {
            self.timing.stream_end(now.saturating_duration_since(last));
        }
        self.trace.push_event(
            TraceEventType::StreamEnd,
            json!({
                "downstream_length": self.trace.downstream_length(),
                "next_expected_sequence": next_expected,
            }),
        );
    }

    /// The upstream summary becomes the reference for upstream content and count
    pub fn summary_received(&mut self, summary: &StreamSummary) {
        self.trace.push_event(
            TraceEventType::SummaryReceived,
            json!({
                "upstream_total_fragments": summary.total_fragments,
                "upstream_total_length": summary.total_content.chars().count(),
                "downstream_fragments": self.trace.downstream_fragment_count,
                "downstream_length": self.trace.downstream_length(),
                "content_hash": summary.content_hash,
            }),
        );
        self.trace.upstream_total_fragments = Some(summary.total_fragments);
        self.trace.upstream_content = summary.total_content.clone();
    }

    pub fn reconciled(&mut self, reconciliation: Reconciliation) {
        self.trace.content_hash_match = reconciliation.hash_match;
        if reconciliation.hash_match == Some(false) {
            warn!(trace_id = %self.trace.id, "Summary content hash mismatch");
        }
        self.reconciliation = Some(reconciliation);
    }

    /// A compensating fragment was written downstream
    pub fn compensation_sent(&mut self, content: &str) {
        self.trace.downstream_content.push_str(content);
        self.trace.compensated = true;
        self.trace.push_event(
            TraceEventType::CompensationSent,
            json!({
                "compensation_length": content.chars().count(),
                "compensation_preview": preview(content),
            }),
        );
    }

    pub fn stream_error(&mut self, message: &str) {
        self.upstream_error = true;
        self.trace
            .push_event(TraceEventType::StreamError, json!({ "error": message }));
    }

    pub fn idle_timeout(&mut self, idle_ms: u64) {
        self.timed_out = true;
        self.trace
            .push_event(TraceEventType::IdleTimeout, json!({ "idle_ms": idle_ms }));
    }

    pub fn client_closed(&mut self) {
        self.trace.push_event(TraceEventType::ClientClosed, json!({}));
    }

    pub fn bus_lagged(&mut self, skipped: u64) {
        self.trace
            .push_event(TraceEventType::BusLagged, json!({ "skipped": skipped }));
    }

    /// Run anomaly detection; appends `anomaly_detected` only when the kind changes
    pub fn detect(&mut self) -> Option<AnomalyReport> {
        let report = detect_anomaly(&self.trace, self.thresholds, now_ms());
        let kind = report.as_ref().map(|r| r.kind);
        if let Some(ref report) = report
            && kind != self.last_kind
        {
            self.refresh_missing();
            warn!(
                trace_id = %self.trace.id,
                kind = %report.kind,
                fragment_gap = report.fragment_gap,
                content_gap = report.content_gap,
                "Anomaly detected"
            );
            let mut data = serde_json::to_value(report).unwrap_or_default();
            data["loss_position"] = json!(self.trace.loss_position);
            data["missing_sequences"] = json!(self.trace.missing_sequences);
            self.trace.push_event(TraceEventType::AnomalyDetected, data);
        }
        self.last_kind = kind;
        report
    }

    fn refresh_missing(&mut self) {
        let missing = missing_sequences(&self.delivered, self.trace.upstream_total_fragments, self.max_seen);
        let range_len = self
            .trace
            .upstream_total_fragments
            .or(self.max_seen.map(|m| m + 1))
            .unwrap_or(0);
        self.trace.loss_position = loss_position(&missing, range_len);
        self.trace.missing_sequences = missing;
    }

    fn fallback_report(&self, kind: AnomalyKind) -> AnomalyReport {
        let (fragment_gap, content_gap) = self
            .reconciliation
            .as_ref()
            .map(|r| (r.fragment_gap, r.content_gap))
            .unwrap_or((0, 0));
        AnomalyReport {
            kind,
            upstream_fragments: self
                .trace
                .upstream_total_fragments
                .unwrap_or(self.trace.upstream_fragment_count),
            downstream_fragments: self.trace.downstream_fragment_count,
            upstream_length: self.trace.upstream_length(),
            downstream_length: self.trace.downstream_length(),
            fragment_gap,
            content_gap,
            detected_at: now_ms(),
        }
    }

    /// Compute final analysis and status, persist, and return the trace
    pub async fn finalize(mut self) -> TraceRecord {
        debug!(trace_id = %self.trace.id, "TraceRecorder::finalize: called");

        self.refresh_missing();
        self.trace.first_fragment_delay_ms = self.timing.first_fragment_delay_ms();
        self.trace.avg_fragment_interval_ms = self.timing.avg_fragment_interval_ms();
        self.trace.last_fragment_delay_ms = self.timing.last_fragment_delay_ms();

        let detected = self.detect();
        let reconciliation_loss = self.reconciliation.as_ref().is_some_and(|r| r.loss);

        let report = match detected {
            Some(report) => Some(report),
            None if self.timed_out => Some(self.fallback_report(AnomalyKind::IdleTimeout)),
            None if self.upstream_error => Some(self.fallback_report(AnomalyKind::UpstreamError)),
            None if reconciliation_loss => {
                let r = self.reconciliation.as_ref().map(|r| r.fragment_gap).unwrap_or(0);
                let kind = if self.thresholds.fragment_loss(r) {
                    AnomalyKind::ChunkCountMismatch
                } else {
                    AnomalyKind::ContentLengthMismatch
                };
                Some(self.fallback_report(kind))
            }
            None => None,
        };

        self.trace.status = if report.is_some() {
            TraceStatus::Anomaly
        } else {
            TraceStatus::Completed
        };
        self.trace.anomaly = report;

        info!(
            trace_id = %self.trace.id,
            status = %self.trace.status,
            upstream_fragments = self.trace.upstream_fragment_count,
            downstream_fragments = self.trace.downstream_fragment_count,
            missing = self.trace.missing_sequences.len(),
            "Trace finalized"
        );

        self.flush().await;
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LossPosition;
    use std::time::Duration;
    use tempfile::tempdir;

    fn recorder(state: &StateManager) -> TraceRecorder {
        TraceRecorder::new(
            TraceRecord::new("m1", "d1", Some("g1".to_string())),
            state.clone(),
            LossThresholds::default(),
            Instant::now(),
        )
    }

    fn deliver(rec: &mut TraceRecorder, seq: u64, content: &str) {
        rec.fragment_received(Some(seq), content, Instant::now());
        rec.fragment_delivered(Some(seq), content);
    }

    #[tokio::test]
    async fn test_clean_stream_completes() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let mut rec = recorder(&state);

        rec.command_dispatched("destination_d1_commands", 1);
        deliver(&mut rec, 0, "Hel");
        deliver(&mut rec, 1, "lo");
        assert!(rec.detect().is_none());
        rec.stream_end(2, Instant::now());

        let trace = rec.finalize().await;
        assert_eq!(trace.status, TraceStatus::Completed);
        assert!(trace.missing_sequences.is_empty());
        assert!(trace.anomaly.is_none());
        assert_eq!(trace.downstream_content, "Hello");

        let stored = state.get_trace(&trace.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TraceStatus::Completed);
    }

    #[tokio::test]
    async fn test_anomaly_event_only_on_kind_change() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let mut rec = recorder(&state);

        deliver(&mut rec, 0, "a");
        for seq in 2..7 {
            rec.fragment_received(Some(seq), "x", Instant::now());
            rec.detect();
        }
        assert_eq!(rec.trace().count_events(TraceEventType::AnomalyDetected), 1);
    }

    #[tokio::test]
    async fn test_tail_loss_after_summary() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let mut rec = recorder(&state);

        for seq in 0..13 {
            deliver(&mut rec, seq, "ab");
        }
        let summary = StreamSummary {
            total_content: "ab".repeat(16),
            total_fragments: 16,
            content_hash: None,
        };
        rec.summary_received(&summary);
        let trace = rec.finalize().await;

        assert_eq!(trace.status, TraceStatus::Anomaly);
        assert_eq!(trace.missing_sequences, vec![13, 14, 15]);
        assert_eq!(trace.loss_position, Some(LossPosition::Tail));
        assert_eq!(trace.anomaly.map(|a| a.kind), Some(AnomalyKind::ChunkCountMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timing_fields() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let mut rec = recorder(&state);

        tokio::time::advance(Duration::from_millis(200)).await;
        deliver(&mut rec, 0, "a");
        tokio::time::advance(Duration::from_millis(100)).await;
        deliver(&mut rec, 1, "b");
        tokio::time::advance(Duration::from_millis(30)).await;
        rec.stream_end(2, Instant::now());

        let trace = rec.finalize().await;
        assert_eq!(trace.first_fragment_delay_ms, Some(200));
        assert_eq!(trace.avg_fragment_interval_ms, Some(100.0));
        assert_eq!(trace.last_fragment_delay_ms, Some(30));
    }

    #[tokio::test]
    async fn test_timeout_marks_anomaly() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let mut rec = recorder(&state);
        rec.idle_timeout(60_000);

        let trace = rec.finalize().await;
        assert_eq!(trace.status, TraceStatus::Anomaly);
        assert_eq!(trace.anomaly.map(|a| a.kind), Some(AnomalyKind::IdleTimeout));
    }

    #[tokio::test]
    async fn test_compensated_content_gap_still_anomaly() {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn(temp.path()).unwrap();
        let mut rec = recorder(&state);

        deliver(&mut rec, 0, "short");
        let total = format!("short{}", "y".repeat(30));
        let summary = StreamSummary {
            total_content: total.clone(),
            total_fragments: 2,
            content_hash: None,
        };
        rec.summary_received(&summary);
        rec.reconciled(Reconciliation {
            fragment_gap: 1,
            content_gap: 30,
            loss: true,
            compensation: Some("y".repeat(30)),
            hash_match: None,
        });
        rec.compensation_sent(&"y".repeat(30));

        let trace = rec.finalize().await;
        assert_eq!(trace.downstream_content, total);
        assert!(trace.compensated);
        assert_eq!(trace.status, TraceStatus::Anomaly);
        assert_eq!(
            trace.anomaly.map(|a| a.kind),
            Some(AnomalyKind::ContentLengthMismatch)
        );
    }
}
