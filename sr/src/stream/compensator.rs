//! Loss detector and compensator
//!
//! Reconciles the upstream `stream_summary` against what was actually
//! delivered downstream and backfills the missing suffix. Lengths are
//! character counts.

use tracing::{debug, info, warn};

use super::reassembler::char_len;

/// When a gap counts as loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossThresholds {
    /// Fragment gap at or above this trips
    pub min_fragment_gap: u64,
    /// Content gap strictly above this trips
    pub min_content_gap: u64,
}

impl Default for LossThresholds {
    fn default() -> Self {
        Self {
            min_fragment_gap: 3,
            min_content_gap: 20,
        }
    }
}

impl LossThresholds {
    pub fn fragment_loss(&self, fragment_gap: i64) -> bool {
        fragment_gap >= self.min_fragment_gap as i64
    }

    pub fn content_loss(&self, content_gap: i64) -> bool {
        content_gap > self.min_content_gap as i64
    }

    pub fn is_loss(&self, fragment_gap: i64, content_gap: i64) -> bool {
        self.fragment_loss(fragment_gap) || self.content_loss(content_gap)
    }
}

/// Final totals reported by the upstream agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub total_content: String,
    pub total_fragments: u64,
    pub content_hash: Option<String>,
}

/// Result of reconciling a summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub fragment_gap: i64,
    pub content_gap: i64,
    pub loss: bool,
    /// Suffix to deliver as one compensating fragment
    pub compensation: Option<String>,
    /// `None` when the summary carried no hash
    pub hash_match: Option<bool>,
}

/// Runs reconciliation at most once per stream
#[derive(Debug)]
pub struct Compensator {
    thresholds: LossThresholds,
    reconciled: bool,
}

impl Compensator {
    pub fn new(thresholds: LossThresholds) -> Self {
        Self {
            thresholds,
            reconciled: false,
        }
    }

    pub fn thresholds(&self) -> LossThresholds {
        self.thresholds
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    /// Compare the summary with what went downstream; `None` if already reconciled
    pub fn reconcile(
        &mut self,
        summary: &StreamSummary,
        downstream_fragments: u64,
        delivered_length: u64,
    ) -> Option<Reconciliation> {
        debug!(
            total_fragments = summary.total_fragments,
            downstream_fragments, delivered_length, "Compensator::reconcile: called"
        );
        if self.reconciled {
            warn!("Ignoring repeated stream summary");
            return None;
        }
        self.reconciled = true;

        let fragment_gap = summary.total_fragments as i64 - downstream_fragments as i64;
        let content_gap = char_len(&summary.total_content) as i64 - delivered_length as i64;
        let loss = self.thresholds.is_loss(fragment_gap, content_gap);

        let compensation = if loss {
            let suffix: String = summary.total_content.chars().skip(delivered_length as usize).collect();
            (!suffix.is_empty()).then_some(suffix)
        } else {
            None
        };

        if loss {
            warn!(
                fragment_gap,
                content_gap,
                compensation_len = compensation.as_deref().map(char_len).unwrap_or(0),
                "Loss detected"
            );
        } else {
            info!(fragment_gap, content_gap, "Stream reconciled without loss");
        }

        let hash_match = summary
            .content_hash
            .as_deref()
            .map(|expected| content_hash(&summary.total_content).eq_ignore_ascii_case(expected));

        Some(Reconciliation {
            fragment_gap,
            content_gap,
            loss,
            compensation,
            hash_match,
        })
    }
}

/// 32-bit rolling string hash (`h = h*31 + unit` over UTF-16 code units), as signed hex
pub fn content_hash(content: &str) -> String {
    let h = content
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    if h < 0 {
        format!("-{:x}", -(h as i64))
    } else {
        format!("{:x}", h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(content: &str, fragments: u64) -> StreamSummary {
        StreamSummary {
            total_content: content.to_string(),
            total_fragments: fragments,
            content_hash: None,
        }
    }

    #[test]
    fn test_compensates_missing_suffix_once() {
        let total: String = ('a'..='z').cycle().take(67).collect();
        let mut comp = Compensator::new(LossThresholds::default());

        let result = comp.reconcile(&summary(&total, 10), 9, 42).unwrap();
        assert!(result.loss);
        assert_eq!(result.content_gap, 25);
        let suffix = result.compensation.unwrap();
        assert_eq!(suffix.chars().count(), 25);
        assert_eq!(suffix, total[42..]);

        assert!(comp.reconcile(&summary(&total, 10), 9, 42).is_none());
        assert!(comp.is_reconciled());
    }

    #[test]
    fn test_small_gaps_are_not_loss() {
        let mut comp = Compensator::new(LossThresholds::default());
        let result = comp.reconcile(&summary(&"x".repeat(30), 5), 3, 10).unwrap();
        assert_eq!(result.fragment_gap, 2);
        assert_eq!(result.content_gap, 20);
        assert!(!result.loss);
        assert!(result.compensation.is_none());
    }

    #[test]
    fn test_fragment_gap_alone_trips() {
        let mut comp = Compensator::new(LossThresholds::default());
        let result = comp.reconcile(&summary("abc", 6), 3, 3).unwrap();
        assert!(result.loss);
        // nothing left to send
        assert!(result.compensation.is_none());
    }

    #[test]
    fn test_custom_thresholds() {
        let mut comp = Compensator::new(LossThresholds {
            min_fragment_gap: 1,
            min_content_gap: 0,
        });
        let result = comp.reconcile(&summary("abcd", 1), 1, 3).unwrap();
        assert!(result.loss);
        assert_eq!(result.compensation.as_deref(), Some("d"));
    }

    #[test]
    fn test_suffix_respects_multibyte_chars() {
        let mut comp = Compensator::new(LossThresholds {
            min_fragment_gap: 100,
            min_content_gap: 0,
        });
        let result = comp.reconcile(&summary("你好世界", 1), 1, 2).unwrap();
        assert_eq!(result.compensation.as_deref(), Some("世界"));
    }

    #[test]
    fn test_content_hash_matches_producers() {
        assert_eq!(content_hash(""), "0");
        assert_eq!(content_hash("a"), "61");
        assert_eq!(content_hash("Hello"), "42628b2");
        assert_eq!(content_hash("Hello, world"), "-1c639654");
        assert_eq!(content_hash("你好"), "9f61d");
    }

    #[test]
    fn test_hash_verification_recorded() {
        let mut comp = Compensator::new(LossThresholds::default());
        let mut s = summary("Hello", 2);
        s.content_hash = Some("42628B2".to_string());
        assert_eq!(comp.reconcile(&s, 2, 5).unwrap().hash_match, Some(true));

        let mut comp = Compensator::new(LossThresholds::default());
        s.content_hash = Some("deadbeef".to_string());
        assert_eq!(comp.reconcile(&s, 2, 5).unwrap().hash_match, Some(false));
    }
}
