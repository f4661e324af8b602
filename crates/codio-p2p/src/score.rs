//! Peer reputation, kept for the lifetime of one resolver.
//!
//! Every finished peer attempt is scored. A verified delivery counts for the
//! peer; a delivery that fails verification or a failed connection counts
//! against it. Cancelled attempts are not scored. The resolver ranks queued
//! providers by reputation before RTT and holds suspect peers back while
//! discovery is still turning up others.

use std::collections::HashMap;

use libp2p::PeerId;
use parking_lot::Mutex;
use tracing::debug;

/// Attempts needed before a peer that mostly fails is treated as suspect.
pub const SUSPECT_AFTER_ATTEMPTS: u64 = 3;

/// Delivery record for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerScore {
    /// Deliveries that verified.
    pub delivered: u64,
    /// Deliveries that did not hash to the requested identifier.
    pub invalid: u64,
    /// Attempts that ended in a transport or negotiation failure.
    pub failed: u64,
}

impl PeerScore {
    pub fn attempts(&self) -> u64 {
        self.delivered + self.invalid + self.failed
    }

    /// Reputation from 0.0 to 1.0, higher is better.
    pub fn reputation(&self) -> f64 {
        if self.attempts() == 0 {
            return 0.5; // Neutral for unseen peers
        }
        self.delivered as f64 / self.attempts() as f64
    }

    /// Has served bytes that did not verify, or fails more often than not.
    pub fn is_suspect(&self) -> bool {
        self.invalid > 0
            || (self.attempts() >= SUSPECT_AFTER_ATTEMPTS && self.reputation() < 0.5)
    }
}

/// Scores for every peer a resolver has tried.
#[derive(Default)]
pub struct PeerScores {
    scores: Mutex<HashMap<PeerId, PeerScore>>,
}

impl PeerScores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score for `peer`, neutral if it has never been tried.
    pub fn get(&self, peer: &PeerId) -> PeerScore {
        self.scores.lock().get(peer).copied().unwrap_or_default()
    }

    pub fn record_delivered(&self, peer: PeerId) {
        self.scores.lock().entry(peer).or_default().delivered += 1;
    }

    pub fn record_invalid(&self, peer: PeerId) {
        let mut scores = self.scores.lock();
        let score = scores.entry(peer).or_default();
        score.invalid += 1;
        debug!(%peer, invalid = score.invalid, "Peer served unverifiable content");
    }

    pub fn record_failed(&self, peer: PeerId) {
        self.scores.lock().entry(peer).or_default().failed += 1;
    }

    pub fn len(&self) -> usize {
        self.scores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.lock().is_empty()
    }

    pub fn clear(&self) {
        self.scores.lock().clear();
    }
}
