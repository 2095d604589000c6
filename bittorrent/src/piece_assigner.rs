//! Piece-to-peers assignment caps (§4.6): bounds how many pieces a peer is
//! working on at once and how many peers are assigned to the same piece.

use std::{collections::{HashMap, HashSet}, net::SocketAddr};

pub struct PieceAssigner {
    max_assigned_per_peer: usize,
    max_peers_per_piece: usize,
    initial_batch_per_peer: usize,
    per_peer: HashMap<SocketAddr, HashSet<u32>>,
    per_piece: HashMap<u32, HashSet<SocketAddr>>,
}

impl PieceAssigner {
    pub fn new(max_assigned_per_peer: usize, max_peers_per_piece: usize, initial_batch_per_peer: usize) -> Self {
        Self {
            max_assigned_per_peer,
            max_peers_per_piece,
            initial_batch_per_peer,
            per_peer: HashMap::new(),
            per_piece: HashMap::new(),
        }
    }

    fn can_assign(&self, peer: SocketAddr, index: u32) -> bool {
        let peer_count = self.per_peer.get(&peer).map_or(0, |s| s.len());
        let piece_count = self.per_piece.get(&index).map_or(0, |s| s.len());
        peer_count < self.max_assigned_per_peer && piece_count < self.max_peers_per_piece
    }

    fn assign(&mut self, peer: SocketAddr, index: u32) {
        self.per_peer.entry(peer).or_default().insert(index);
        self.per_piece.entry(index).or_default().insert(peer);
    }

    /// Assigns as many of `indexes` to `peer` as both caps allow, up to
    /// `initial_batch_per_peer`. Returns the subset actually assigned.
    pub fn assign_initial(&mut self, indexes: &[u32], peer: SocketAddr) -> Vec<u32> {
        let mut assigned = Vec::new();
        for &index in indexes {
            if assigned.len() >= self.initial_batch_per_peer {
                break;
            }
            if self.can_assign(peer, index) {
                self.assign(peer, index);
                assigned.push(index);
            }
        }
        assigned
    }

    /// Assigns a single additional piece (e.g. on an incoming `have`) if
    /// both caps allow it.
    pub fn assign_one(&mut self, peer: SocketAddr, index: u32) -> bool {
        if self.can_assign(peer, index) {
            self.assign(peer, index);
            true
        } else {
            false
        }
    }

    pub fn unassign(&mut self, peer: &SocketAddr, index: u32) {
        if let Some(pieces) = self.per_peer.get_mut(peer) {
            pieces.remove(&index);
        }
        if let Some(peers) = self.per_piece.get_mut(&index) {
            peers.remove(peer);
        }
    }

    pub fn assignees(&self, index: u32) -> impl Iterator<Item = &SocketAddr> {
        self.per_piece.get(&index).into_iter().flatten()
    }

    pub fn unassign_peer(&mut self, peer: &SocketAddr) {
        if let Some(pieces) = self.per_peer.remove(peer) {
            for index in pieces {
                if let Some(peers) = self.per_piece.get_mut(&index) {
                    peers.remove(peer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_initial_respects_batch_size() {
        let mut assigner = PieceAssigner::new(50, 4, 2);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let assigned = assigner.assign_initial(&[0, 1, 2, 3], peer);
        assert_eq!(assigned.len(), 2);
    }

    #[test]
    fn max_peers_per_piece_caps_assignment() {
        let mut assigner = PieceAssigner::new(50, 1, 10);
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        assert!(assigner.assign_one(a, 0));
        assert!(!assigner.assign_one(b, 0));
    }
}
