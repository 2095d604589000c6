//! Admission/limits bookkeeping for the Coordinator (§4.6): counts and
//! tracks peers by role, and tracks an "accepted within the last admission
//! window" flag for the single-eviction-per-window policy in §4.1.

use std::{collections::HashSet, net::SocketAddr, time::{Duration, Instant}};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRole {
    Initiated,
    Accepted,
}

pub struct ActivePeersTracker {
    initiated: HashSet<SocketAddr>,
    accepted: HashSet<SocketAddr>,
    max_initiate: usize,
    max_accept: usize,
    admission_window: Duration,
    last_accept_eviction: Option<Instant>,
}

impl ActivePeersTracker {
    pub fn new(max_initiate: usize, max_accept: usize, admission_window: Duration) -> Self {
        Self {
            initiated: HashSet::new(),
            accepted: HashSet::new(),
            max_initiate,
            max_accept,
            admission_window,
            last_accept_eviction: None,
        }
    }

    pub fn is_active(&self, peer: &SocketAddr) -> bool {
        self.initiated.contains(peer) || self.accepted.contains(peer)
    }

    pub fn add_initiated(&mut self, peer: SocketAddr) {
        self.initiated.insert(peer);
    }

    pub fn add_accepted(&mut self, peer: SocketAddr) {
        self.accepted.insert(peer);
    }

    pub fn remove(&mut self, peer: &SocketAddr) {
        self.initiated.remove(peer);
        self.accepted.remove(peer);
    }

    pub fn can_initiate(&self) -> bool {
        self.initiated.len() < self.max_initiate
    }

    pub fn initiate_room(&self) -> usize {
        self.max_initiate.saturating_sub(self.initiated.len())
    }

    pub fn accept_at_capacity(&self) -> bool {
        self.accepted.len() >= self.max_accept
    }

    /// Whether an accepted peer was already evicted to make room within
    /// the current admission window (§4.1: at most one eviction per window).
    pub fn has_recently_evicted(&self, now: Instant) -> bool {
        self.last_accept_eviction
            .is_some_and(|t| now.duration_since(t) < self.admission_window)
    }

    /// Evicts one uniformly-random accepted peer, recording the eviction
    /// time so a second one can't happen within the same window.
    pub fn evict_random_accepted(&mut self, now: Instant) -> Option<SocketAddr> {
        use rand::seq::IteratorRandom;
        let victim = self.accepted.iter().copied().choose(&mut rand::thread_rng())?;
        self.accepted.remove(&victim);
        self.last_accept_eviction = Some(now);
        Some(victim)
    }

    pub fn active_count(&self) -> usize {
        self.initiated.len() + self.accepted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_separate_initiate_and_accept_caps() {
        let mut tracker = ActivePeersTracker::new(1, 1, Duration::from_secs(60));
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        tracker.add_initiated(a);
        assert!(!tracker.can_initiate());
        tracker.add_accepted(b);
        assert!(tracker.accept_at_capacity());
    }

    #[test]
    fn eviction_window_allows_only_one_eviction_per_window() {
        let mut tracker = ActivePeersTracker::new(10, 1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(!tracker.has_recently_evicted(now));
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        tracker.add_accepted(a);
        tracker.evict_random_accepted(now);
        assert!(tracker.has_recently_evicted(now));
    }
}
