//! PWP handshake (§4.4): wire codec plus the `Handshaker` that drives one
//! handshake to completion, initiator or responder side, before handing
//! the transport off to the matching SwarmCoordinator.

use std::time::Duration;
use bytes::{Buf, BufMut, BytesMut};
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::TcpStream, time};
use tokio_util::codec::{Decoder, Encoder};
use crate::{registry::Registry, torrent::TorrentTx, InfoHash, PeerId};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Handshake {
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { protocol: PROTOCOL, reserved: [0; 8], info_hash, peer_id }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len(), 68, "encoded handshake length is not 68 bytes");
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != 19 {
            return Err(PeerError::IncorrectProtocol);
        }

        if src.remaining() < 68 {
            return Ok(None);
        }

        src.advance(1);
        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { protocol, reserved, info_hash, peer_id }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

async fn write_handshake(stream: &mut TcpStream, handshake: Handshake) -> Result<(), PeerError> {
    let mut buf = BytesMut::new();
    HandshakeCodec.encode(handshake, &mut buf)?;
    time::timeout(HANDSHAKE_TIMEOUT, stream.write_all(&buf)).await.map_err(|_| PeerError::Timeout)??;
    Ok(())
}

async fn read_handshake(stream: &mut TcpStream) -> Result<Handshake, PeerError> {
    let mut buf = [0u8; 68];
    time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut buf)).await.map_err(|_| PeerError::Timeout)??;
    let mut bytes = BytesMut::from(&buf[..]);
    HandshakeCodec.decode(&mut bytes)?.ok_or(PeerError::NoHandshake)
}

/// Drives the two handshake shapes in §4.4: initiator sends first then
/// reads, responder reads first then (on a known info-hash) sends.
#[derive(Clone)]
pub struct Handshaker {
    registry: Registry,
    peer_id: PeerId,
}

impl Handshaker {
    pub fn new(registry: Registry, peer_id: PeerId) -> Self {
        Self { registry, peer_id }
    }

    /// Outbound connection: we already know which torrent we're dialing
    /// for, so the only failure mode is the remote echoing back a
    /// different info-hash.
    pub async fn initiate(&self, mut stream: TcpStream, info_hash: InfoHash) -> Result<(TcpStream, PeerId), PeerError> {
        write_handshake(&mut stream, Handshake::new(info_hash, self.peer_id)).await?;
        let remote = read_handshake(&mut stream).await?;
        if remote.info_hash != info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }
        Ok((stream, remote.peer_id))
    }

    /// Inbound connection: the remote announces the info-hash first; we
    /// resolve it against the registry of currently-active torrents (one
    /// listener demultiplexes for all of them) before committing to a reply.
    pub async fn accept(&self, mut stream: TcpStream) -> Result<(TcpStream, TorrentTx, PeerId), PeerError> {
        let remote = read_handshake(&mut stream).await?;
        let tx = self.registry.lookup(&remote.info_hash).await.ok_or(PeerError::IncorrectInfoHash)?;
        write_handshake(&mut stream, Handshake::new(remote.info_hash, self.peer_id)).await?;
        Ok((stream, tx, remote.peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip_is_68_bytes() {
        let mut buf = BytesMut::new();
        let h = Handshake::new([2u8; 20], [1u8; 20]);
        HandshakeCodec.encode(h, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [2u8; 20]);
        assert_eq!(decoded.peer_id, [1u8; 20]);
        assert_eq!(decoded.reserved, [0u8; 8]);
    }

    #[test]
    fn encode_matches_literal_scenario() {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([2u8; 20], [1u8; 20]), &mut buf).unwrap();
        let mut expected = vec![19];
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0u8; 8]);
        expected.extend_from_slice(&[2u8; 20]);
        expected.extend_from_slice(&[1u8; 20]);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn decode_with_incomplete_data_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"BitTorrent protocol");
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_wrong_protocol_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(20);
        buf.extend_from_slice(b"Invalid protocol!!!!");
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(&[0u8; 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_retains_trailing_bytes_after_one_handshake() {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([3u8; 20], [4u8; 20]), &mut buf).unwrap();
        buf.extend_from_slice(b"extra");
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [3u8; 20]);
        assert_eq!(&buf[..], b"extra");
    }
}
