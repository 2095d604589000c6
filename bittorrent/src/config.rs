use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// Per-torrent tuneables, named directly after §4.1/§4.3/§4.6.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {

    // Admission caps (§4.1).
    pub max_initiate: usize,

    pub max_accept: usize,

    // Admission window within which an evicted-accepted-peer re-admit is
    // allowed at most once.
    pub admission_window: Duration,

    // BlockPlanner tuneables (§4.3).
    pub max_queue_length: usize,

    pub max_requested_size: usize,

    pub seconds_until_stale: u64,

    // Batch size for outbound block requests per unchoke/download tick (§4.2).
    pub request_batch_size: usize,

    // Interested-resend window while choked (§4.2).
    pub interested_resend: Duration,

    // Retrieval coalescing window (§4.1).
    pub retrieval_coalesce: Duration,

    // PieceAssigner caps (§4.6).
    pub max_assigned_per_peer: usize,

    pub max_peers_per_piece: usize,

    pub initial_batch_per_peer: usize,

    // PieceCache byte capacity (§4.6), default 50 MiB.
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_initiate: 10,
            max_accept: 10,
            admission_window: Duration::from_secs(60),
            max_queue_length: 100,
            max_requested_size: 200,
            seconds_until_stale: 60,
            request_batch_size: 20,
            interested_resend: Duration::from_secs(60),
            retrieval_coalesce: Duration::from_secs(3),
            max_assigned_per_peer: 50,
            max_peers_per_piece: 4,
            initial_batch_per_peer: 10,
            cache_capacity: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    pub announce_interval: Duration,

    pub min_max_peers: (u32, u32),

    pub engine: EngineConfig,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            engine: EngineConfig::default(),
        }
    }
}

/// Process-wide settings shared by every torrent: client identity and the
/// single listener all torrents are demultiplexed through (§9: the
/// Handshaker resolves an inbound connection's info-hash against the set of
/// currently-active torrents, so one socket serves all of them).
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {

    pub client_id: [u8; 20],

    pub listen_address: SocketAddr,
}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
        }
    }
}
