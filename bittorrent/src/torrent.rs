//! `Torrent` (§4.1): the SwarmCoordinator. One per active torrent, owning
//! admission, piece/peer bookkeeping, and the block-request service. Event
//! driven — everything that happens to a torrent arrives as a
//! `TorrentCommand` on its own mailbox, re-derived from the teacher's
//! `torrent::Torrent` actor shape (a `tokio::select!` loop over a command
//! channel plus a periodic tick) but replacing its choke-algorithm/picker
//! logic with the assignment and admission rules in §4.1/§4.6.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::{Duration, Instant}};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    active_peers::{ActivePeersTracker, AdmissionRole},
    announced_tracker::AnnouncedPeersTracker,
    block::Block,
    config::ClientConfig,
    health_tracker::HealthTracker,
    metainfo::MetaInfo,
    p2p::{self, Handshaker, PeerCommand, PeerTx, ViolationReason},
    piece::Piece,
    piece_assigner::PieceAssigner,
    piece_tracker::PieceTracker,
    registry::{Registry, RegistryGuard},
    store::{FileInfo, StoreHandle},
    tracker::{AnnounceParams, Event, TrackersHandle},
    Bitfield, InfoHash, PeerId,
};

pub use crate::config::TorrentConfig;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub type Result<T> = std::result::Result<T, TorrentError>;

pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

const ADMISSION_TICK: Duration = Duration::from_secs(5);

/// Minimum HealthTracker score gap (§4.6) required before a newly
/// announcing peer preempts the worst existing assignee of an
/// already-at-cap piece.
const HEALTH_UPGRADE_MARGIN: f64 = 0.2;

/// Every event that can move a torrent forward (§4.1): tracker announces,
/// the Handshaker handing off a new transport, and everything a
/// PeerSession reports about its conversation with one remote peer.
pub enum TorrentCommand {

    AnnounceResult(Vec<SocketAddr>),

    HandshakeCompleted { peer: SocketAddr, stream: TcpStream, peer_id: PeerId, role: AdmissionRole },

    HandshakeFailed { peer: SocketAddr },

    PeerChoked { peer: SocketAddr },

    PeerUnchoked { peer: SocketAddr },

    PeerAnnouncedPiece { peer: SocketAddr, index: u32 },

    PeerSentBitfield { peer: SocketAddr, bitfield: Bitfield },

    BlockRequestFromPeer { peer: SocketAddr, index: u32, offset: u32, length: u32 },

    BlockRequestCancelled { peer: SocketAddr, index: u32, offset: u32, length: u32 },

    PeerDownloadedPiece { peer: SocketAddr, piece: Piece, data: Vec<u8> },

    StoreResult { index: u32, result: std::result::Result<(), ()> },

    RetrievalResult { index: u32, result: std::result::Result<Vec<u8>, ()> },

    ProtocolViolation { peer: SocketAddr, reason: ViolationReason },

    PeerSessionTerminated { peer: SocketAddr },

    /// Controlled stop (§5): drains to trackers/peers before the actor exits.
    Shutdown,
}

/// What a torrent reports to whoever is driving it (a front end, or the
/// process that spawned it) — deliberately thin, mirroring the teacher's
/// own `DownloadEvent` used to feed progress bars/stats views.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    PieceCompleted { index: u32 },
    Completed,
}

struct PendingRequest {
    peer: SocketAddr,
    offset: u32,
    length: u32,
}

struct PeerEntry {
    tx: PeerTx,
    #[allow(dead_code)]
    session_handle: JoinHandle<()>,
    #[allow(dead_code)]
    peer_id: PeerId,
}

/// Immutable, shareable facts about the torrent a coordinator is running
/// (§4.1's "static per-torrent context").
pub struct TorrentContext {
    pub info_hash: InfoHash,
    pub client_id: PeerId,
    pub listen_port: u16,
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_len: usize,
    pub total_len: u64,
    pub num_pieces: u32,
    pub dir_name: String,
    pub files: Vec<FileInfo>,
}

fn piece_length(ctx: &TorrentContext, index: u32) -> u32 {
    if index + 1 == ctx.num_pieces {
        let covered = ctx.piece_len as u64 * (ctx.num_pieces.saturating_sub(1)) as u64;
        ctx.total_len.saturating_sub(covered) as u32
    } else {
        ctx.piece_len as u32
    }
}

pub struct Torrent {
    ctx: Arc<TorrentContext>,
    engine: crate::config::EngineConfig,
    announce_interval: Duration,
    peers: HashMap<SocketAddr, PeerEntry>,
    active: ActivePeersTracker,
    piece_tracker: PieceTracker,
    piece_assigner: PieceAssigner,
    health: HealthTracker,
    announced: AnnouncedPeersTracker,
    pending_requests: HashMap<u32, Vec<PendingRequest>>,
    last_retrieval: HashMap<u32, Instant>,
    storing: HashMap<u32, (SocketAddr, Piece, Vec<u8>)>,
    own_bitfield: Bitfield,
    trackers: TrackersHandle,
    store: StoreHandle,
    handshaker: Handshaker,
    _registry_guard: RegistryGuard,
    torrent_rx: TorrentRx,
    torrent_tx: TorrentTx,
    events_tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl Torrent {

    /// Activates the torrent in the Store, registers it under its
    /// info-hash, and returns a handle the caller keeps: the join handle
    /// to await shutdown, a sender to command it, and the download-event
    /// stream to watch progress.
    pub async fn spawn(
        metainfo: MetaInfo,
        config: TorrentConfig,
        client: ClientConfig,
        registry: Registry,
        store: StoreHandle,
    ) -> Result<(JoinHandle<()>, TorrentTx, mpsc::UnboundedReceiver<DownloadEvent>)> {
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let torrent = Torrent::new(metainfo, config, client, registry, store, torrent_tx.clone(), torrent_rx, events_tx).await?;
        let handle = tokio::spawn(async move { torrent.run().await });
        Ok((handle, torrent_tx, events_rx))
    }

    async fn new(
        metainfo: MetaInfo,
        config: TorrentConfig,
        client: ClientConfig,
        registry: Registry,
        store: StoreHandle,
        torrent_tx: TorrentTx,
        torrent_rx: TorrentRx,
        events_tx: mpsc::UnboundedSender<DownloadEvent>,
    ) -> Result<Self> {
        let info_hash = metainfo.info_hash();
        let piece_hashes = metainfo.piece_hashes();
        let num_pieces = metainfo.num_pieces();
        let dir_name = metainfo.name().to_string();

        store.activate(info_hash, dir_name.clone(), piece_hashes.clone(), config.engine.cache_capacity).await?;
        let missing = store.get_missing(info_hash).await?;

        let mut own_bitfield: Bitfield = bitvec::vec::BitVec::repeat(false, num_pieces as usize);
        for index in 0..num_pieces {
            if !missing.contains(&index) {
                own_bitfield.set(index as usize, true);
            }
        }

        let mut piece_tracker = PieceTracker::new(num_pieces);
        for index in 0..num_pieces {
            if !missing.contains(&index) {
                piece_tracker.mark_already_stored(index);
            }
        }

        let ctx = Arc::new(TorrentContext {
            info_hash,
            client_id: client.client_id,
            listen_port: client.listen_address.port(),
            piece_hashes,
            piece_len: metainfo.piece_len(),
            total_len: metainfo.total_len(),
            num_pieces,
            dir_name,
            files: metainfo.files(),
        });

        let registry_guard = registry.register(info_hash, torrent_tx.clone()).await;
        let handshaker = Handshaker::new(registry, client.client_id);
        let trackers = TrackersHandle::new(metainfo.trackers());

        Ok(Self {
            ctx,
            engine: config.engine,
            announce_interval: config.announce_interval,
            peers: HashMap::new(),
            active: ActivePeersTracker::new(config.engine.max_initiate, config.engine.max_accept, config.engine.admission_window),
            piece_tracker,
            piece_assigner: PieceAssigner::new(config.engine.max_assigned_per_peer, config.engine.max_peers_per_piece, config.engine.initial_batch_per_peer),
            health: HealthTracker::new(),
            announced: AnnouncedPeersTracker::new(500),
            pending_requests: HashMap::new(),
            last_retrieval: HashMap::new(),
            storing: HashMap::new(),
            own_bitfield,
            trackers,
            store,
            handshaker,
            _registry_guard: registry_guard,
            torrent_rx,
            torrent_tx,
            events_tx,
        })
    }

    #[tracing::instrument(name = "torrent", skip_all, fields(info_hash = %hex::encode(self.ctx.info_hash)))]
    async fn run(mut self) {
        tracing::info!("torrent starting");
        self.trackers.start(self.torrent_tx.clone()).await;
        self.announce(Some(Event::Started));

        let mut admission_tick = tokio::time::interval(ADMISSION_TICK);
        admission_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Regular (no-event) re-announce at the configured interval (§8
        // scenario 6: startup -> regular -> stopped). `interval_at` skips
        // the immediate first tick `interval` fires on creation, so this
        // doesn't double up with the Started announce just above.
        let mut announce_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.announce_interval,
            self.announce_interval,
        );
        announce_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {

                cmd = self.torrent_rx.recv() => {
                    match cmd {
                        Some(TorrentCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_event(cmd).await,
                    }
                }

                _ = admission_tick.tick() => {
                    self.try_initiate_connections();
                }

                _ = announce_tick.tick() => {
                    self.announce(None);
                }

            }
        }

        self.shutdown().await;
    }

    async fn handle_event(&mut self, cmd: TorrentCommand) {
        match cmd {

            TorrentCommand::Shutdown => unreachable!("handled by run()'s select loop"),

            TorrentCommand::AnnounceResult(peers) => {
                self.announced.extend(peers);
                self.try_initiate_connections();
            }

            TorrentCommand::HandshakeCompleted { peer, stream, peer_id, role } => {
                self.admit(peer, stream, peer_id, role);
            }

            TorrentCommand::HandshakeFailed { peer } => {
                self.active.remove(&peer);
                tracing::debug!(%peer, "handshake failed");
            }

            TorrentCommand::PeerChoked { peer } => {
                self.health.record_choke(peer, Instant::now());
            }

            TorrentCommand::PeerUnchoked { peer } => {
                self.health.record_unchoke(peer, Instant::now());
            }

            TorrentCommand::PeerAnnouncedPiece { peer, index } => {
                self.piece_tracker.update_with_index(peer, index);
                if self.piece_tracker.is_missing(index) {
                    if self.piece_assigner.assign_one(peer, index) {
                        self.start_download(peer, index);
                    } else {
                        self.try_upgrade_assignment(peer, index);
                    }
                }
            }

            TorrentCommand::PeerSentBitfield { peer, bitfield } => {
                self.piece_tracker.update_with_bitfield(peer, &bitfield);
                let candidates: Vec<u32> = bitfield.iter_ones()
                    .map(|i| i as u32)
                    .filter(|i| self.piece_tracker.is_missing(*i))
                    .collect();
                let assigned = self.piece_assigner.assign_initial(&candidates, peer);
                for index in assigned {
                    self.start_download(peer, index);
                }
            }

            TorrentCommand::BlockRequestFromPeer { peer, index, offset, length } => {
                self.serve_or_fetch(peer, index, offset, length);
            }

            TorrentCommand::BlockRequestCancelled { peer, index, offset, length } => {
                if let Some(pending) = self.pending_requests.get_mut(&index) {
                    pending.retain(|p| !(p.peer == peer && p.offset == offset && p.length == length));
                }
            }

            TorrentCommand::PeerDownloadedPiece { peer, piece, data } => {
                self.piece_tracker.mark_piece_as_storing(piece.index, peer);
                self.storing.insert(piece.index, (peer, piece.clone(), data.clone()));
                self.store.store(self.ctx.info_hash, piece, data, self.torrent_tx.clone());
            }

            TorrentCommand::StoreResult { index, result } => {
                self.handle_store_result(index, result);
            }

            TorrentCommand::RetrievalResult { index, result } => {
                self.handle_retrieval_result(index, result);
            }

            TorrentCommand::ProtocolViolation { peer, reason } => {
                tracing::warn!(%peer, ?reason, "protocol violation, terminating peer");
                self.terminate_peer(&peer);
            }

            TorrentCommand::PeerSessionTerminated { peer } => {
                self.cleanup_peer(&peer);
            }
        }
    }

    /// Admission policy (§4.1): reject a peer already active under either
    /// role; an initiator only wins a slot that's still free by the time
    /// its handshake lands; an acceptor may trigger one within-window
    /// eviction of a random accepted peer to make room, and is refused
    /// outright if that eviction already happened this window.
    fn admit(&mut self, peer: SocketAddr, stream: TcpStream, peer_id: PeerId, role: AdmissionRole) {
        if self.active.is_active(&peer) {
            tracing::debug!(%peer, "already active, dropping duplicate transport");
            return;
        }

        match role {
            AdmissionRole::Initiated => {
                if !self.active.can_initiate() {
                    tracing::debug!(%peer, "no room left to initiate, dropping transport");
                    return;
                }
                self.active.add_initiated(peer);
            }
            AdmissionRole::Accepted => {
                if self.active.accept_at_capacity() {
                    let now = Instant::now();
                    if self.active.has_recently_evicted(now) {
                        tracing::debug!(%peer, "accept at capacity and already evicted this window, refusing");
                        return;
                    }
                    if let Some(victim) = self.active.evict_random_accepted(now) {
                        tracing::debug!(%victim, "evicted to admit a new accepted peer");
                        self.terminate_peer(&victim);
                    }
                }
                self.active.add_accepted(peer);
            }
        }

        self.spawn_peer(peer, stream, peer_id);
    }

    fn spawn_peer(&mut self, peer: SocketAddr, stream: TcpStream, peer_id: PeerId) {
        let handle = p2p::spawn_session(
            peer,
            stream,
            self.ctx.info_hash,
            self.ctx.num_pieces,
            self.own_bitfield.clone(),
            self.torrent_tx.clone(),
            self.engine,
        );
        let _ = handle.tx.send(PeerCommand::SendBitfield(self.own_bitfield.clone()));
        self.peers.insert(peer, PeerEntry { tx: handle.tx, session_handle: handle.session_handle, peer_id });
    }

    fn start_download(&self, peer: SocketAddr, index: u32) {
        let Some(entry) = self.peers.get(&peer) else { return };
        let length = piece_length(&self.ctx, index);
        let piece = Piece::new(index, self.ctx.piece_hashes[index as usize], length);
        let _ = entry.tx.send(PeerCommand::StartDownload(piece));
    }

    /// The assignment heuristic HealthTracker exists to drive (§4.6): when
    /// `index` is already assigned to `max_peers_per_piece` peers and
    /// `candidate` just announced having it too, swap it in for the
    /// currently-worst assignee if `candidate`'s choke/unchoke history is
    /// meaningfully better — cancelling the displaced peer's in-flight
    /// blocks for this piece so it can be reassigned elsewhere.
    fn try_upgrade_assignment(&mut self, candidate: SocketAddr, index: u32) {
        let now = Instant::now();
        let worst = self.piece_assigner.assignees(index)
            .copied()
            .filter(|peer| *peer != candidate)
            .min_by(|a, b| self.health.score(a, now).total_cmp(&self.health.score(b, now)));
        let Some(worst) = worst else { return };

        let candidate_score = self.health.score(&candidate, now);
        let worst_score = self.health.score(&worst, now);
        if candidate_score <= worst_score + HEALTH_UPGRADE_MARGIN {
            return;
        }

        self.piece_assigner.unassign(&worst, index);
        if let Some(entry) = self.peers.get(&worst) {
            let _ = entry.tx.send(PeerCommand::CancelPiece(index));
        }
        if self.piece_assigner.assign_one(candidate, index) {
            self.start_download(candidate, index);
        }
    }

    /// Block-request service (§4.1): every request is recorded against its
    /// piece's pending-requesters list; a Store retrieval is kicked off
    /// only if none is already in flight within the coalescing window —
    /// the Store's own cache absorbs repeat hits cheaply regardless.
    fn serve_or_fetch(&mut self, peer: SocketAddr, index: u32, offset: u32, length: u32) {
        self.pending_requests.entry(index).or_default().push(PendingRequest { peer, offset, length });

        let now = Instant::now();
        let should_fetch = match self.last_retrieval.get(&index) {
            Some(t) => now.duration_since(*t) > self.engine.retrieval_coalesce,
            None => true,
        };
        if should_fetch {
            self.last_retrieval.insert(index, now);
            self.store.retrieve(self.ctx.info_hash, index, self.torrent_tx.clone());
        }
    }

    fn handle_retrieval_result(&mut self, index: u32, result: std::result::Result<Vec<u8>, ()>) {
        let Some(requesters) = self.pending_requests.remove(&index) else { return };
        match result {
            Ok(data) => {
                for req in requesters {
                    let Some(entry) = self.peers.get(&req.peer) else { continue };
                    let start = req.offset as usize;
                    if start > data.len() {
                        continue;
                    }
                    let end = (start + req.length as usize).min(data.len());
                    let slice = data[start..end].to_vec();
                    let block = Block { piece_index: index, offset: req.offset, length: req.length };
                    let _ = entry.tx.send(PeerCommand::ServeBlock(block, slice));
                }
            }
            Err(()) => {
                tracing::warn!(index, "retrieval failed; pending requesters dropped, next request re-triggers it");
            }
        }
    }

    /// On a successful store (§4.1): drop the piece from every other
    /// assignee, telling each to cancel it; announce `have` to every peer
    /// not among the assignees (they already know). Signal completion once
    /// no piece remains missing. On failure, retry with the same bytes.
    fn handle_store_result(&mut self, index: u32, result: std::result::Result<(), ()>) {
        match result {
            Ok(()) => {
                self.storing.remove(&index);
                let Some(downloader) = self.piece_tracker.remove_storing_piece(index) else { return };
                if (index as usize) < self.own_bitfield.len() {
                    self.own_bitfield.set(index as usize, true);
                }

                let assignees: Vec<SocketAddr> = self.piece_assigner.assignees(index).copied().collect();
                for &assignee in &assignees {
                    self.piece_assigner.unassign(&assignee, index);
                    if assignee != downloader {
                        if let Some(entry) = self.peers.get(&assignee) {
                            let _ = entry.tx.send(PeerCommand::CancelPiece(index));
                        }
                    }
                }

                for (&addr, entry) in self.peers.iter() {
                    if !assignees.contains(&addr) {
                        let _ = entry.tx.send(PeerCommand::AnnounceHave(index));
                    }
                }

                if self.piece_tracker.get_missing_count() == 0 {
                    tracing::info!("torrent download complete");
                    let _ = self.events_tx.send(DownloadEvent::Completed);
                    self.announce(Some(Event::Completed));
                    self.compose();
                } else {
                    let _ = self.events_tx.send(DownloadEvent::PieceCompleted { index });
                }
            }
            Err(()) => {
                if let Some((_, piece, data)) = self.storing.get(&index).cloned() {
                    tracing::warn!(index, "store failed, retrying");
                    self.store.store(self.ctx.info_hash, piece, data, self.torrent_tx.clone());
                }
            }
        }
    }

    fn compose(&self) {
        let store = self.store.clone();
        let info_hash = self.ctx.info_hash;
        let files = self.ctx.files.clone();
        tokio::spawn(async move {
            match store.compose(info_hash, files).await {
                Ok(path) => tracing::info!(?path, "composed final file(s)"),
                Err(e) => tracing::error!("failed to compose final file(s): {}", e),
            }
        });
    }

    fn terminate_peer(&self, peer: &SocketAddr) {
        if let Some(entry) = self.peers.get(peer) {
            let _ = entry.tx.send(PeerCommand::Stop);
        }
    }

    fn cleanup_peer(&mut self, peer: &SocketAddr) {
        if self.peers.remove(peer).is_some() {
            self.active.remove(peer);
            self.piece_tracker.remove_peer(peer);
            self.piece_assigner.unassign_peer(peer);
            self.health.remove(peer);
        }
    }

    fn try_initiate_connections(&mut self) {
        let room = self.active.initiate_room();
        if room == 0 {
            return;
        }
        let candidates = self.announced.take_candidates(room, &|addr| self.active.is_active(addr));
        for addr in candidates {
            self.active.add_initiated(addr);
            self.dial(addr);
        }
    }

    fn dial(&self, addr: SocketAddr) {
        let handshaker = self.handshaker.clone();
        let info_hash = self.ctx.info_hash;
        let torrent_tx = self.torrent_tx.clone();
        tokio::spawn(async move {
            let outcome = async {
                let stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr)).await??;
                handshaker.initiate(stream, info_hash).await
            }.await;

            match outcome {
                Ok((stream, peer_id)) => {
                    let _ = torrent_tx.send(TorrentCommand::HandshakeCompleted {
                        peer: addr, stream, peer_id, role: AdmissionRole::Initiated,
                    });
                }
                Err(_) => {
                    let _ = torrent_tx.send(TorrentCommand::HandshakeFailed { peer: addr });
                }
            }
        });
    }

    fn announce(&self, event: Option<Event>) {
        let missing = self.piece_tracker.get_missing_count() as u64;
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.ctx.listen_port,
            uploaded: 0,
            downloaded: (self.ctx.num_pieces as u64).saturating_sub(missing) * self.ctx.piece_len as u64,
            left: missing * self.ctx.piece_len as u64,
            event,
            num_want: if missing == 0 { None } else { Some(50) },
        };
        let _ = self.trackers.tracker_tx.send(Some(params));
    }

    async fn shutdown(&mut self) {
        tracing::info!("torrent stopping");
        self.announce(Some(Event::Stopped));
        self.trackers.shutdown().await;
        for (_, entry) in self.peers.drain() {
            let _ = entry.tx.send(PeerCommand::Stop);
        }
        self.store.deactivate(self.ctx.info_hash);
    }
}
