//! Anomaly classification and loss-position analysis over a trace

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::debug;

use crate::domain::{AnomalyKind, AnomalyReport, LossPosition, TraceRecord};
use crate::stream::LossThresholds;

/// Compare upstream and downstream counts and lengths
///
/// The upstream fragment reference is the summary total when one arrived,
/// otherwise the number of fragments received so far.
pub fn detect_anomaly(trace: &TraceRecord, thresholds: LossThresholds, now: i64) -> Option<AnomalyReport> {
    if trace.upstream_fragment_count == 0 && trace.upstream_total_fragments.is_none() {
        return None;
    }

    let upstream_fragments = trace
        .upstream_total_fragments
        .unwrap_or(0)
        .max(trace.upstream_fragment_count);
    let upstream_length = trace.upstream_length();
    let downstream_length = trace.downstream_length();
    let fragment_gap = upstream_fragments as i64 - trace.downstream_fragment_count as i64;
    let content_gap = upstream_length as i64 - downstream_length as i64;

    let kind = if trace.downstream_fragment_count > trace.upstream_fragment_count {
        AnomalyKind::DuplicateDelivery
    } else if thresholds.fragment_loss(fragment_gap) {
        AnomalyKind::ChunkCountMismatch
    } else if thresholds.content_loss(content_gap) {
        AnomalyKind::ContentLengthMismatch
    } else {
        return None;
    };

    debug!(trace_id = %trace.id, %kind, fragment_gap, content_gap, "detect_anomaly: tripped");
    Some(AnomalyReport {
        kind,
        upstream_fragments,
        downstream_fragments: trace.downstream_fragment_count,
        upstream_length,
        downstream_length,
        fragment_gap,
        content_gap,
        detected_at: now,
    })
}

/// Range members never delivered downstream
///
/// The range is `0..total` when the upstream total is known, else `0..=max_seen`.
pub fn missing_sequences(delivered: &BTreeSet<u64>, total: Option<u64>, max_seen: Option<u64>) -> Vec<u64> {
    let end = match (total, max_seen) {
        (Some(total), _) => total,
        (None, Some(max)) => max + 1,
        (None, None) => return Vec::new(),
    };
    (0..end).filter(|s| !delivered.contains(s)).collect()
}

/// Classify where in `0..range_len` the missing sequences fall
///
/// The range is split into quarters of `ceil(range_len / 4)`; the first is
/// head, the last is tail, the rest is middle.
pub fn loss_position(missing: &[u64], range_len: u64) -> Option<LossPosition> {
    if missing.is_empty() || range_len == 0 {
        return None;
    }

    let quarter = range_len.div_ceil(4);
    let classify = |s: u64| {
        if s < quarter {
            LossPosition::Head
        } else if s >= range_len.saturating_sub(quarter) {
            LossPosition::Tail
        } else {
            LossPosition::Middle
        }
    };

    let first = classify(missing[0]);
    if missing.iter().all(|s| classify(*s) == first) {
        Some(first)
    } else {
        Some(LossPosition::Mixed)
    }
}

/// Per-stream timing samples
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    first_fragment: Option<Duration>,
    interval_total: Duration,
    interval_count: u32,
    last_fragment_to_end: Option<Duration>,
}

impl TimingStats {
    /// Record a fragment arriving `since_request` after the request and
    /// `since_previous` after the previous fragment
    pub fn fragment(&mut self, since_request: Duration, since_previous: Option<Duration>) {
        if self.first_fragment.is_none() {
            self.first_fragment = Some(since_request);
        }
        if let Some(gap) = since_previous {
            self.interval_total += gap;
            self.interval_count += 1;
        }
    }

    pub fn stream_end(&mut self, since_last_fragment: Duration) {
        self.last_fragment_to_end = Some(since_last_fragment);
    }

    pub fn first_fragment_delay_ms(&self) -> Option<u64> {
        self.first_fragment.map(|d| d.as_millis() as u64)
    }

    pub fn avg_fragment_interval_ms(&self) -> Option<f64> {
        (self.interval_count > 0).then(|| self.interval_total.as_micros() as f64 / 1000.0 / self.interval_count as f64)
    }

    pub fn last_fragment_delay_ms(&self) -> Option<u64> {
        self.last_fragment_to_end.map(|d| d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(up: u64, down: u64, up_text: &str, down_text: &str) -> TraceRecord {
        let mut t = TraceRecord::new("m1", "d1", None);
        t.upstream_fragment_count = up;
        t.downstream_fragment_count = down;
        t.upstream_content = up_text.to_string();
        t.downstream_content = down_text.to_string();
        t
    }

    #[test]
    fn test_no_fragments_no_anomaly() {
        assert!(detect_anomaly(&trace(0, 0, "", ""), LossThresholds::default(), 0).is_none());
    }

    #[test]
    fn test_chunk_count_mismatch() {
        let report = detect_anomaly(&trace(5, 2, "abcde", "ab"), LossThresholds::default(), 7).unwrap();
        assert_eq!(report.kind, AnomalyKind::ChunkCountMismatch);
        assert_eq!(report.fragment_gap, 3);
        assert_eq!(report.detected_at, 7);
    }

    #[test]
    fn test_content_length_mismatch() {
        let up = "x".repeat(30);
        let report = detect_anomaly(&trace(2, 1, &up, "x"), LossThresholds::default(), 0).unwrap();
        assert_eq!(report.kind, AnomalyKind::ContentLengthMismatch);
        assert_eq!(report.content_gap, 29);
    }

    #[test]
    fn test_duplicate_delivery_flagged() {
        let report = detect_anomaly(&trace(2, 3, "ab", "abb"), LossThresholds::default(), 0).unwrap();
        assert_eq!(report.kind, AnomalyKind::DuplicateDelivery);
    }

    #[test]
    fn test_summary_total_is_reference() {
        let mut t = trace(2, 2, "ab", "ab");
        assert!(detect_anomaly(&t, LossThresholds::default(), 0).is_none());
        t.upstream_total_fragments = Some(6);
        let report = detect_anomaly(&t, LossThresholds::default(), 0).unwrap();
        assert_eq!(report.kind, AnomalyKind::ChunkCountMismatch);
        assert_eq!(report.upstream_fragments, 6);
    }

    #[test]
    fn test_missing_sequences_ranges() {
        let delivered: BTreeSet<u64> = [0, 1, 3].into_iter().collect();
        assert_eq!(missing_sequences(&delivered, None, Some(4)), vec![2, 4]);
        assert_eq!(missing_sequences(&delivered, Some(6), Some(4)), vec![2, 4, 5]);
        assert!(missing_sequences(&BTreeSet::new(), None, None).is_empty());
    }

    #[test]
    fn test_loss_position_quartiles() {
        assert_eq!(loss_position(&[0, 1], 12), Some(LossPosition::Head));
        assert_eq!(loss_position(&[5, 6], 12), Some(LossPosition::Middle));
        assert_eq!(loss_position(&[10, 11], 12), Some(LossPosition::Tail));
        assert_eq!(loss_position(&[0, 11], 12), Some(LossPosition::Mixed));
        assert_eq!(loss_position(&[], 12), None);
    }

    #[test]
    fn test_loss_position_small_ranges() {
        assert_eq!(loss_position(&[0], 1), Some(LossPosition::Head));
        assert_eq!(loss_position(&[1], 2), Some(LossPosition::Tail));
        assert_eq!(loss_position(&[1, 2], 4), Some(LossPosition::Middle));
    }

    #[test]
    fn test_timing_stats() {
        let mut stats = TimingStats::default();
        assert!(stats.avg_fragment_interval_ms().is_none());

        stats.fragment(Duration::from_millis(300), None);
        stats.fragment(Duration::from_millis(400), Some(Duration::from_millis(100)));
        stats.fragment(Duration::from_millis(700), Some(Duration::from_millis(300)));
        stats.stream_end(Duration::from_millis(50));

        assert_eq!(stats.first_fragment_delay_ms(), Some(300));
        assert_eq!(stats.avg_fragment_interval_ms(), Some(200.0));
        assert_eq!(stats.last_fragment_delay_ms(), Some(50));
    }
}
