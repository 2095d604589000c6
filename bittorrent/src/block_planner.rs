//! Per-peer block scheduling (§4.3) — the state machine is re-derived from
//! §4.3 directly rather than carried over from the teacher's
//! `picker/partial_piece.rs`, which has a different, cross-peer shared
//! shape and an endgame branch that's a non-goal here.
//!
//! A `BlockKey` is in exactly one of `missing`/`requested`/`downloaded` at
//! a time for a given piece (§3's partition invariant); `last_queued`
//! metadata for a key persists across that transition so a reclaimed
//! stale request is reinserted into `missing` with its original queue
//! freshness intact rather than looking freshly queued (§9 point 1, §4.3
//! step 1's "missing retaining the original entry").

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};
use crate::{
    block::{block_len, num_blocks, Block, BlockData, BlockKey},
    piece::Piece,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("block was not requested")]
    BlockNotRequested,
}

struct PieceState {
    piece: Piece,
    remaining: usize,
}

struct RequestedEntry {
    block: Block,
    last_queued: Option<Instant>,
    requested_at: Instant,
}

pub struct BlockPlanner {
    block_size: usize,
    max_queue_length: usize,
    max_requested_size: usize,
    seconds_until_stale: u64,

    queue: VecDeque<BlockKey>,
    missing: HashMap<BlockKey, (Block, Option<Instant>)>,
    requested: HashMap<BlockKey, RequestedEntry>,
    downloaded: HashMap<u32, Vec<BlockData>>,
    pieces: HashMap<u32, PieceState>,
}

/// A piece whose every block has arrived, assembled in offset order.
pub struct CompletedPiece {
    pub piece: Piece,
    pub data: Vec<u8>,
}

impl BlockPlanner {
    pub fn new(block_size: usize, max_queue_length: usize, max_requested_size: usize, seconds_until_stale: u64) -> Self {
        Self {
            block_size,
            max_queue_length,
            max_requested_size,
            seconds_until_stale,
            queue: VecDeque::new(),
            missing: HashMap::new(),
            requested: HashMap::new(),
            downloaded: HashMap::new(),
            pieces: HashMap::new(),
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces.contains_key(&index)
    }

    pub fn num_pieces_in_progress(&self) -> usize {
        self.pieces.len()
    }

    /// Splits `piece` into blocks of `block_size` (final block may be
    /// shorter), all inserted into `missing` with timestamp 0 (never
    /// queued).
    pub fn add_piece(&mut self, piece: Piece) {
        let length = piece.length as usize;
        let index = piece.index;
        let n = num_blocks(length);
        for block_idx in 0..n {
            let offset = block_idx as usize * self.block_size;
            let len = block_len(length, block_idx as usize) as u32;
            let block = Block { piece_index: index, offset: offset as u32, length: len };
            self.missing.insert(block.key(), (block, None));
        }
        self.pieces.insert(index, PieceState { piece, remaining: n as usize });
    }

    /// Up to `count` blocks to request next, per the four-step algorithm
    /// in §4.3.
    pub fn schedule_blocks(&mut self, count: usize, now: Instant) -> Vec<Block> {
        // Step 1: if saturated, reclaim stale outstanding requests back
        // into `missing`, preserving their original last-queued stamp.
        if self.requested.len() >= self.max_requested_size {
            let stale_window = Duration::from_secs(self.seconds_until_stale);
            let stale: Vec<BlockKey> = self.requested.iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.requested_at) > stale_window)
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                if let Some(entry) = self.requested.remove(&key) {
                    self.missing.insert(key, (entry.block, entry.last_queued));
                }
            }
        }

        // Step 2: budget for this call.
        let budget = count.min(self.max_requested_size.saturating_sub(self.requested.len()));

        // Step 3: refill the queue if it's running low.
        if self.queue.len() < budget {
            let thrash_window = Duration::from_secs(5000);
            let queued: std::collections::HashSet<BlockKey> = self.queue.iter().copied().collect();
            let mut candidates: Vec<(BlockKey, Option<Instant>)> = self.missing.iter()
                .filter(|(key, (_, last_queued))| {
                    !queued.contains(key)
                        && !last_queued.is_some_and(|t| now.saturating_duration_since(t) < thrash_window)
                })
                .map(|(key, (_, last_queued))| (*key, *last_queued))
                .collect();
            candidates.sort_by_key(|(_, last_queued)| *last_queued);

            let need = self.max_queue_length.saturating_sub(self.queue.len()).min(candidates.len());
            for (key, _) in candidates.into_iter().take(need) {
                if let Some((_, last_queued)) = self.missing.get_mut(&key) {
                    *last_queued = Some(now);
                }
                self.queue.push_back(key);
            }
        }

        // Step 4: pop up to `budget` blocks, moving them into `requested`.
        let mut out = Vec::new();
        while out.len() < budget {
            let Some(key) = self.queue.pop_front() else { break };
            let Some((block, last_queued)) = self.missing.remove(&key) else { continue };
            self.requested.insert(key, RequestedEntry { block, last_queued, requested_at: now });
            out.push(block);
        }
        out
    }

    /// Records an incoming downloaded block. Returns the assembled piece
    /// if this was the last outstanding block for it.
    pub fn add_downloaded_block(&mut self, block: BlockData) -> Result<Option<CompletedPiece>, PlannerError> {
        let key = block.key();
        if self.requested.remove(&key).is_none() {
            return Err(PlannerError::BlockNotRequested);
        }
        self.queue.retain(|k| *k != key);

        let index = block.piece_index;
        let Some(state) = self.pieces.get_mut(&index) else {
            return Err(PlannerError::BlockNotRequested);
        };
        state.remaining -= 1;

        if state.remaining == 0 {
            let mut blocks = self.downloaded.remove(&index).unwrap_or_default();
            blocks.push(block);
            blocks.sort_by_key(|b| b.offset);
            let data: Vec<u8> = blocks.into_iter().flat_map(|b| b.data).collect();
            let piece = self.pieces.remove(&index).unwrap().piece;
            Ok(Some(CompletedPiece { piece, data }))
        } else {
            self.downloaded.entry(index).or_default().push(block);
            Ok(None)
        }
    }

    /// Returns every in-flight block key for `index` (so the caller can
    /// send PWP `cancel`s) and drops all bookkeeping for that piece.
    pub fn cancel_piece(&mut self, index: u32) -> Vec<BlockKey> {
        let cancelled: Vec<BlockKey> = self.requested.keys().copied().filter(|k| k.piece_index == index).collect();

        self.queue.retain(|k| k.piece_index != index);
        self.pieces.remove(&index);
        self.missing.retain(|k, _| k.piece_index != index);
        self.requested.retain(|k, _| k.piece_index != index);
        self.downloaded.remove(&index);

        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(piece: u32, offset: u32, len: u32) -> Block {
        Block { piece_index: piece, offset, length: len }
    }

    #[test]
    fn schedule_blocks_pops_front_of_queue_and_leaves_missing_timestamps_untouched() {
        let mut planner = BlockPlanner::new(2, 100, 200, 60);
        let t0 = Instant::now();
        let b1 = block(1, 0, 2);
        let b2 = block(1, 2, 2);
        let b3 = block(1, 4, 2);
        let b4 = block(1, 6, 2);

        // Seed state directly: queue already holds all four, `missing`
        // still carries their last-queued stamps (per-key ts = 10,11,12,5
        // relative offsets from t0).
        planner.pieces.insert(1, PieceState { piece: Piece::new(1, [0; 20], 8), remaining: 4 });
        for (b, ts) in [(b1, 10), (b2, 11), (b3, 12), (b4, 5)] {
            planner.missing.insert(b.key(), (b, Some(t0 + Duration::from_secs(ts))));
            planner.queue.push_back(b.key());
        }

        let now = t0 + Duration::from_secs(100);
        let out = planner.schedule_blocks(3, now);

        assert_eq!(out, vec![b1, b2, b3]);
        assert_eq!(planner.queue.len(), 1);
        assert_eq!(planner.queue[0], b4.key());
        assert!(planner.requested.contains_key(&b1.key()));
        assert!(planner.requested.contains_key(&b2.key()));
        assert!(planner.requested.contains_key(&b3.key()));
        // b4 never left `missing`; its timestamp is untouched.
        let (_, ts) = planner.missing.get(&b4.key()).unwrap();
        assert_eq!(*ts, Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn add_downloaded_block_assembles_completed_piece_sorted_by_offset() {
        let mut planner = BlockPlanner::new(2, 100, 200, 60);
        let now = Instant::now();
        planner.pieces.insert(1, PieceState { piece: Piece::new(1, [7; 20], 8), remaining: 1 });

        // Three blocks already downloaded, one missing (offset 6).
        planner.downloaded.insert(1, vec![
            BlockData { piece_index: 1, offset: 0, data: b"aa".to_vec() },
            BlockData { piece_index: 1, offset: 2, data: b"bb".to_vec() },
            BlockData { piece_index: 1, offset: 4, data: b"cc".to_vec() },
        ]);
        let last = block(1, 6, 2);
        planner.requested.insert(last.key(), RequestedEntry { block: last, last_queued: None, requested_at: now });

        let result = planner.add_downloaded_block(BlockData { piece_index: 1, offset: 6, data: b"dd".to_vec() }).unwrap();
        let completed = result.expect("piece should be complete");
        assert_eq!(completed.data, b"aabbccdd".to_vec());
        assert!(planner.pieces.is_empty());
        assert!(planner.missing.is_empty());
        assert!(planner.downloaded.is_empty());
        assert!(planner.requested.is_empty());
        assert!(planner.queue.is_empty());
    }

    #[test]
    fn add_downloaded_block_rejects_unrequested_block() {
        let mut planner = BlockPlanner::new(2, 100, 200, 60);
        let err = planner.add_downloaded_block(BlockData { piece_index: 9, offset: 0, data: vec![1, 2] }).unwrap_err();
        assert_eq!(err, PlannerError::BlockNotRequested);
    }

    #[test]
    fn add_piece_splits_into_correctly_sized_blocks() {
        let mut planner = BlockPlanner::new(2, 100, 200, 60);
        planner.add_piece(Piece::new(0, [0; 20], 5));
        assert_eq!(planner.pieces[&0].remaining, 3);
        assert_eq!(planner.missing.len(), 3);
    }

    #[test]
    fn cancel_piece_returns_in_flight_keys_and_clears_state() {
        let mut planner = BlockPlanner::new(2, 100, 200, 60);
        let now = Instant::now();
        planner.add_piece(Piece::new(0, [0; 20], 6));
        let scheduled = planner.schedule_blocks(3, now);
        assert_eq!(scheduled.len(), 3);

        let cancelled = planner.cancel_piece(0);
        assert_eq!(cancelled.len(), 3);
        assert!(!planner.pieces.contains_key(&0));
        assert!(planner.missing.is_empty());
        assert!(planner.requested.is_empty());
    }
}
