//! `PeerSession` (§4.2): one duplex transport ↔ one PWP conversation. Owns
//! the Channel and the BlockPlanner; enforces the incoming-message state
//! machine and the download-progress policy, re-derived from the teacher's
//! `p2p::session::PeerSession` run loop (`tokio::select!` over the stream,
//! a command mailbox, and a periodic tick) but driving the new protocol
//! rules and violation taxonomy instead of the teacher's choke algorithm.

use std::{net::SocketAddr, time::{Duration, Instant}};
use sha1::Digest;
use tokio::{net::TcpStream, sync::mpsc, time::MissedTickBehavior};
use crate::{
    block::{Block, BlockData},
    block_planner::{BlockPlanner, PlannerError},
    config::EngineConfig,
    torrent::{TorrentCommand, TorrentTx},
    Bitfield, InfoHash,
};
use super::{channel::Channel, message::Message, PeerCommand, PeerError, PeerTx, ViolationReason};

const TICK: Duration = Duration::from_secs(1);

pub struct PeerSession {
    address: SocketAddr,
    info_hash: InfoHash,
    num_pieces: u32,
    coordinator: TorrentTx,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
    engine: EngineConfig,
    planner: BlockPlanner,

    local_choke: bool,
    remote_choke: bool,
    local_interested: bool,
    remote_interested: bool,

    /// Our own pieces, as announced to this peer. Snapshot taken at
    /// session start; kept current by `send_bitfield`/`announce_have`.
    bitfield: Bitfield,
    bitfield_received: bool,

    last_interested_sent: Option<Instant>,
}

impl PeerSession {

    pub fn new(
        address: SocketAddr,
        info_hash: InfoHash,
        num_pieces: u32,
        initial_bitfield: Bitfield,
        coordinator: TorrentTx,
        engine: EngineConfig,
    ) -> (Self, PeerTx) {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let planner = BlockPlanner::new(
            crate::BLOCK_SIZE,
            engine.max_queue_length,
            engine.max_requested_size,
            engine.seconds_until_stale,
        );
        let session = Self {
            address,
            info_hash,
            num_pieces,
            coordinator,
            cmd_rx,
            engine,
            planner,
            local_choke: true,
            remote_choke: true,
            local_interested: false,
            remote_interested: false,
            bitfield: initial_bitfield,
            bitfield_received: false,
            last_interested_sent: None,
        };
        (session, tx)
    }

    pub async fn run(&mut self, stream: TcpStream) {
        let mut channel = Channel::new(stream);
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {

                incoming = channel.recv() => {
                    match incoming {
                        Some(Ok(msg)) => {
                            if self.handle_message(msg).await.is_err() {
                                break;
                            }
                            if self.handle_message_followup(&mut channel, Instant::now()).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!("decode error from {}: {}", self.address, e);
                            break;
                        }
                        None => {
                            tracing::debug!("transport closed by {}", self.address);
                            break;
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::Stop) | None => break,
                        Some(cmd) => {
                            if self.handle_command(cmd, &mut channel, Instant::now()).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.drive_download_policy(&mut channel, Instant::now()).await.ok();
                }

            }
        }

        channel.stop().await;
        let _ = self.coordinator.send(TorrentCommand::PeerSessionTerminated { peer: self.address });
    }

    async fn handle_command(&mut self, cmd: PeerCommand, channel: &mut Channel, now: Instant) -> Result<(), PeerError> {
        match cmd {

            PeerCommand::StartDownload(piece) => {
                self.planner.add_piece(piece);
                self.drive_download_policy(channel, now).await?;
            }

            PeerCommand::Choke => {
                self.local_choke = true;
                channel.send(Message::Choke).await?;
            }

            PeerCommand::Unchoke => {
                self.local_choke = false;
                channel.send(Message::Unchoke).await?;
            }

            PeerCommand::AnnounceHave(index) => {
                if (index as usize) < self.bitfield.len() {
                    self.bitfield.set(index as usize, true);
                }
                channel.send(Message::Have { index }).await?;
            }

            PeerCommand::SendBitfield(bitfield) => {
                self.bitfield = bitfield.clone();
                channel.send(Message::Bitfield(bitfield)).await?;
            }

            PeerCommand::CancelPiece(index) => {
                for key in self.planner.cancel_piece(index) {
                    channel.send(Message::Cancel(Block {
                        piece_index: key.piece_index,
                        offset: key.offset,
                        length: key.length,
                    })).await?;
                }
            }

            PeerCommand::ServeBlock(block, data) => {
                channel.send(Message::Piece(BlockData {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                })).await?;
            }

            PeerCommand::Stop => unreachable!("handled by the caller"),
        }
        Ok(())
    }

    /// Incoming-message state machine (§4.2). Returns `Err` to terminate the
    /// session — either a reported protocol violation or a send failure.
    async fn handle_message(&mut self, msg: Message) -> Result<(), PeerError> {
        match msg {

            Message::KeepAlive => {}

            Message::Choke => {
                if !self.remote_choke {
                    self.remote_choke = true;
                    self.notify(TorrentCommand::PeerChoked { peer: self.address })?;
                }
            }

            Message::Unchoke => {
                if self.remote_choke {
                    self.remote_choke = false;
                    self.notify(TorrentCommand::PeerUnchoked { peer: self.address })?;
                }
            }

            Message::Interested => {
                self.remote_interested = true;
            }

            Message::NotInterested => {
                self.remote_interested = false;
            }

            Message::Have { index } => {
                self.notify(TorrentCommand::PeerAnnouncedPiece { peer: self.address, index })?;
            }

            Message::Bitfield(bitfield) => {
                if self.bitfield_received {
                    return self.violate(ViolationReason::BitfieldRepeat);
                }
                self.bitfield_received = true;
                self.notify(TorrentCommand::PeerSentBitfield { peer: self.address, bitfield })?;
            }

            Message::Request(block) => {
                if self.local_choke {
                    return self.violate(ViolationReason::RequestWhileChoked);
                }
                let announced = (block.piece_index as usize) < self.bitfield.len()
                    && self.bitfield[block.piece_index as usize];
                if !announced {
                    return self.violate(ViolationReason::RequestUnannounced);
                }
                self.notify(TorrentCommand::BlockRequestFromPeer {
                    peer: self.address,
                    index: block.piece_index,
                    offset: block.offset,
                    length: block.length,
                })?;
            }

            Message::Piece(block) => {
                match self.planner.add_downloaded_block(block) {
                    Ok(Some(completed)) => {
                        let mut hasher = sha1::Sha1::new();
                        hasher.update(&completed.data);
                        let digest: [u8; 20] = hasher.finalize().into();
                        if digest == completed.piece.hash {
                            self.notify(TorrentCommand::PeerDownloadedPiece {
                                peer: self.address,
                                piece: completed.piece,
                                data: completed.data,
                            })?;
                        } else {
                            return self.violate(ViolationReason::InvalidPiece);
                        }
                    }
                    Ok(None) => {}
                    Err(PlannerError::BlockNotRequested) => {
                        return self.violate(ViolationReason::BlockNotRequested);
                    }
                }
            }

            Message::Cancel(block) => {
                // Real cancellation (§9 open question 5, resolved): forward so
                // the Coordinator can drop this requester from its pending
                // block-request list before it's served.
                self.notify(TorrentCommand::BlockRequestCancelled {
                    peer: self.address,
                    index: block.piece_index,
                    offset: block.offset,
                    length: block.length,
                })?;
            }

        }
        Ok(())
    }

    /// Re-drives the download policy after any inbound message that could
    /// change it (an `unchoke`, or a completed block freeing planner budget).
    async fn handle_message_followup(&mut self, channel: &mut Channel, now: Instant) -> Result<(), PeerError> {
        self.drive_download_policy(channel, now).await
    }

    /// Driven on `start_download`, remote `unchoke`, each downloaded block,
    /// and the periodic tick (§4.2).
    async fn drive_download_policy(&mut self, channel: &mut Channel, now: Instant) -> Result<(), PeerError> {
        if self.remote_choke {
            let elapsed = match self.last_interested_sent {
                Some(t) => now.duration_since(t) > self.engine.interested_resend,
                None => true,
            };
            if elapsed {
                channel.send(Message::Interested).await?;
                self.local_interested = true;
                self.last_interested_sent = Some(now);
            }
            return Ok(());
        }

        if self.planner.num_pieces_in_progress() == 0 {
            return Ok(());
        }

        let blocks = self.planner.schedule_blocks(self.engine.request_batch_size, now);
        for block in blocks {
            channel.send(Message::Request(block)).await?;
        }
        Ok(())
    }

    fn notify(&self, cmd: TorrentCommand) -> Result<(), PeerError> {
        self.coordinator.send(cmd).map_err(|_| PeerError::ChannelClosed)
    }

    fn violate(&self, reason: ViolationReason) -> Result<(), PeerError> {
        let _ = self.coordinator.send(TorrentCommand::ProtocolViolation { peer: self.address, reason });
        Err(PeerError::InvalidMessage)
    }
}
