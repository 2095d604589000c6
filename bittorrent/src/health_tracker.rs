//! Per-peer choke/unchoke timeline (§4.6), consulted by assignment
//! heuristics to prefer peers that unchoke promptly and stay unchoked.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

#[derive(Default)]
struct PeerHealth {
    unchoked_since: Option<Instant>,
    total_unchoked: std::time::Duration,
    choke_events: u32,
    unchoke_events: u32,
    first_seen: Option<Instant>,
}

#[derive(Default)]
pub struct HealthTracker {
    peers: HashMap<SocketAddr, PeerHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, peer: SocketAddr) -> &mut PeerHealth {
        self.peers.entry(peer).or_insert_with(|| PeerHealth { first_seen: Some(Instant::now()), ..Default::default() })
    }

    pub fn record_choke(&mut self, peer: SocketAddr, now: Instant) {
        let health = self.entry(peer);
        if let Some(since) = health.unchoked_since.take() {
            health.total_unchoked += now.saturating_duration_since(since);
        }
        health.choke_events += 1;
    }

    pub fn record_unchoke(&mut self, peer: SocketAddr, now: Instant) {
        let health = self.entry(peer);
        health.unchoked_since.get_or_insert(now);
        health.unchoke_events += 1;
    }

    pub fn remove(&mut self, peer: &SocketAddr) {
        self.peers.remove(peer);
    }

    /// Fraction of observed lifetime the peer has spent unchoked, in
    /// `[0.0, 1.0]`. Peers with no history score 0.5 (neutral) so unproven
    /// peers aren't penalized ahead of known-bad ones.
    pub fn score(&self, peer: &SocketAddr, now: Instant) -> f64 {
        let Some(health) = self.peers.get(peer) else { return 0.5 };
        let Some(first_seen) = health.first_seen else { return 0.5 };
        let lifetime = now.saturating_duration_since(first_seen);
        if lifetime.is_zero() {
            return 0.5;
        }
        let mut unchoked = health.total_unchoked;
        if let Some(since) = health.unchoked_since {
            unchoked += now.saturating_duration_since(since);
        }
        (unchoked.as_secs_f64() / lifetime.as_secs_f64()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unproven_peer_scores_neutral() {
        let tracker = HealthTracker::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(tracker.score(&peer, Instant::now()), 0.5);
    }

    #[test]
    fn mostly_unchoked_peer_scores_high() {
        let mut tracker = HealthTracker::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let t0 = Instant::now();
        tracker.record_unchoke(peer, t0);
        let t1 = t0 + Duration::from_secs(10);
        assert!(tracker.score(&peer, t1) > 0.9);
    }
}
