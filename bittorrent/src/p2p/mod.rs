use std::net::SocketAddr;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{config::EngineConfig, piece::Piece, Bitfield, InfoHash};

mod channel;
mod handshake;
mod message;
mod session;

pub use channel::Channel;
pub use handshake::{Handshake, HandshakeCodec, Handshaker, PROTOCOL};
pub use message::{decode_messages, Message, MessageCodec};
pub use session::PeerSession;

pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent more than once in a session")]
    BitfieldRepeat,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timed out")]
    Timeout,

    #[error("channel send failed")]
    ChannelClosed,
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        PeerError::ChannelClosed
    }
}

/// Protocol violations a PeerSession can detect, reported to the
/// Coordinator verbatim as tagged reasons (§7) rather than strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationReason {
    BitfieldRepeat,
    RequestWhileChoked,
    RequestUnannounced,
    InvalidBlockSent,
    InvalidPiece,
    BlockNotRequested,
}

/// Operations the Coordinator issues to one PeerSession (§4.2).
pub enum PeerCommand {

    StartDownload(Piece),

    Choke,

    Unchoke,

    AnnounceHave(u32),

    SendBitfield(Bitfield),

    CancelPiece(u32),

    /// The Coordinator resolved a pending `request` against the cache or
    /// store; serve this slice to the peer.
    ServeBlock(crate::block::Block, Vec<u8>),

    Stop,

}

pub struct PeerHandle {

    pub tx: PeerTx,

    pub session_handle: JoinHandle<()>,

}

/// Spawns a PeerSession actor that owns `stream` for the rest of its life
/// (ownership transfer per §5: listener/Handshaker → Coordinator →
/// PeerSession → Channel).
pub fn spawn_session(
    address: SocketAddr,
    stream: TcpStream,
    info_hash: InfoHash,
    num_pieces: u32,
    initial_bitfield: Bitfield,
    coordinator_tx: crate::torrent::TorrentTx,
    engine: EngineConfig,
) -> PeerHandle {
    let (mut session, tx) = PeerSession::new(address, info_hash, num_pieces, initial_bitfield, coordinator_tx, engine);
    let session_handle = tokio::spawn(async move {
        session.run(stream).await;
    }.instrument(tracing::info_span!("peer", addr = %address)));
    PeerHandle { tx, session_handle }
}
