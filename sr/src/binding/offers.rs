//! Awaiting-binding registry
//!
//! Maps a stream ID to the device that was asked for a binding photo. Entries
//! expire after a fixed TTL and are swept by a background task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Offer {
    claim: String,
    created_at: Instant,
}

/// Process-wide registry of streams awaiting binding evidence
#[derive(Debug)]
pub struct BindingOffers {
    offers: Mutex<HashMap<String, Offer>>,
    ttl: Duration,
}

impl BindingOffers {
    pub fn new(ttl: Duration) -> Self {
        debug!(?ttl, "BindingOffers::new: called");
        Self {
            offers: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Offer>> {
        self.offers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `stream_id` as awaiting a photo from `claim`
    pub fn offer(&self, stream_id: &str, claim: &str) {
        debug!(%stream_id, %claim, "BindingOffers::offer: called");
        self.lock().insert(
            stream_id.to_string(),
            Offer {
                claim: claim.to_string(),
                created_at: Instant::now(),
            },
        );
    }

    /// Whether `stream_id` awaits evidence from exactly `claim` and has not expired
    pub fn is_awaiting(&self, stream_id: &str, claim: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .get(stream_id)
            .is_some_and(|offer| offer.claim == claim && now.saturating_duration_since(offer.created_at) < self.ttl)
    }

    /// Remove the mark, returning whether one existed
    pub fn clear(&self, stream_id: &str) -> bool {
        debug!(%stream_id, "BindingOffers::clear: called");
        self.lock().remove(stream_id).is_some()
    }

    /// Drop expired offers, returning how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let mut offers = self.lock();
        let before = offers.len();
        offers.retain(|_, offer| now.saturating_duration_since(offer.created_at) < self.ttl);
        before - offers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep on a fixed interval until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let offers = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let removed = offers.sweep(Instant::now());
                if removed > 0 {
                    info!(removed, remaining = offers.len(), "Swept expired binding offers");
                }
            }
        })
    }
}
