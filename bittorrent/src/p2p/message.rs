//! PWP wire codec (§4.5): whole-message `Encoder`/`Decoder` plus a
//! streaming helper that decodes as many complete frames as a buffer
//! holds and hands back the undecoded tail, as the Channel needs.
//!
//! The `port` message (id 9, DHT port announcement) is dropped — DHT is
//! a non-goal here.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block::{Block, BlockData}, Bitfield};
use super::PeerError;

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    KeepAlive,

    Choke,

    Unchoke,

    Interested,

    NotInterested,

    Have { index: u32 },

    Bitfield(Bitfield),

    Request(Block),

    Piece(BlockData),

    Cancel(Block),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            }

            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            }

            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            }

            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            }

            // have: <len=0005><id=4><piece index>
            Message::Have { index } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(index);
            }

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            }

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_index);
                dst.put_u32(block.offset);
                dst.put_u32(block.length);
            }

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_index);
                dst.put_u32(block.offset);
                dst.extend_from_slice(&block.data);
            }

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_index);
                dst.put_u32(block.offset);
                dst.put_u32(block.length);
            }

        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < 4 {
            return Ok(None);
        }

        let msg_len = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;

        if src.remaining() < 4 + msg_len {
            return Ok(None);
        }
        src.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg = match src.get_u8() {
            0 => {
                if msg_len != 1 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Choke
            }
            1 => {
                if msg_len != 1 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Unchoke
            }
            2 => {
                if msg_len != 1 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Interested
            }
            3 => {
                if msg_len != 1 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::NotInterested
            }
            4 => {
                if msg_len != 5 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Have { index: src.get_u32() }
            }
            5 => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            6 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_index = src.get_u32();
                let offset = src.get_u32();
                let length = src.get_u32();
                Message::Request(Block { piece_index, offset, length })
            }
            7 => {
                if msg_len < 9 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_index = src.get_u32();
                let offset = src.get_u32();
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Piece(BlockData { piece_index, offset, data })
            }
            8 => {
                if msg_len != 13 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_index = src.get_u32();
                let offset = src.get_u32();
                let length = src.get_u32();
                Message::Cancel(Block { piece_index, offset, length })
            }
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

/// Decodes every complete frame out of `data`, returning the decoded
/// messages in order and whatever incomplete tail remains. A hard decode
/// error anywhere aborts immediately — the whole byte stream is
/// considered unrecoverable (§4.2: one decode error ends the Channel).
pub fn decode_messages(data: &[u8]) -> Result<(Vec<Message>, Vec<u8>), PeerError> {
    let mut buf = BytesMut::from(data);
    let mut codec = MessageCodec;
    let mut messages = Vec::new();
    while let Some(msg) = codec.decode(&mut buf)? {
        messages.push(msg);
    }
    Ok((messages, buf.to_vec()))
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { index } => write!(f, "have piece {}", index),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request {{ piece: {}, offset: {}, length: {} }}", block.piece_index, block.offset, block.length),
            Message::Piece(block) => write!(f, "piece {{ piece: {}, offset: {}, length: {} }}", block.piece_index, block.offset, block.data.len()),
            Message::Cancel(block) => write!(f, "cancel {{ piece: {}, offset: {}, length: {} }}", block.piece_index, block.offset, block.length),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trips_every_message_variant() {
        let bitfield: Bitfield = bitvec![u8, Msb0; 1, 0, 1];
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { index: 11 },
            Message::Bitfield(bitfield),
            Message::Request(Block { piece_index: 11, offset: 0x134000, length: 0x4000 }),
            Message::Piece(BlockData { piece_index: 11, offset: 0x134000, data: vec![1, 2, 3] }),
            Message::Cancel(Block { piece_index: 11, offset: 0x134000, length: 0x4000 }),
        ];
        for msg in messages {
            let mut buf = encode(msg.clone());
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_rejects_unknown_message_id() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        let err = MessageCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PeerError::InvalidMessageId(255)));
    }

    #[test]
    fn decode_rejects_payload_bearing_choke() {
        // len=5, id=0 (choke) with 4 bytes of bogus trailing payload: a
        // fixed-length message whose advertised length doesn't match its
        // payload is an error (§4.5/§7), not four stray bytes left for the
        // next frame to misparse.
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(0);
        buf.put_u32(0xdead_beef);
        let err = MessageCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, PeerError::InvalidMessage));
    }

    #[test]
    fn streaming_decode_matches_literal_scenario() {
        let messages = vec![
            Message::Have { index: 5 },
            Message::Bitfield(Bitfield::from_vec(b"bitfield_data".to_vec())),
            Message::Choke,
            Message::Request(Block { piece_index: 5, offset: 10, length: 15 }),
            Message::Interested,
            Message::Cancel(Block { piece_index: 5, offset: 10, length: 15 }),
            Message::NotInterested,
            Message::Piece(BlockData { piece_index: 5, offset: 10, data: b"test_block".to_vec() }),
            Message::Have { index: 30 },
            Message::KeepAlive,
            Message::Unchoke,
            Message::Request(Block { piece_index: 100, offset: 200, length: 300 }),
        ];

        let mut encoded = BytesMut::new();
        for msg in &messages {
            MessageCodec.encode(msg.clone(), &mut encoded).unwrap();
        }
        encoded.extend_from_slice(b"leftover");

        let (decoded, tail) = decode_messages(&encoded).unwrap();
        assert_eq!(decoded, messages);
        assert_eq!(tail, b"leftover".to_vec());
    }
}
