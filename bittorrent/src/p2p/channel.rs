//! Owns the transport after handshake (§4.2): concatenates incoming bytes
//! with an internal buffer and decodes as many complete PWP frames as
//! possible per read, retaining at most one partial message. A single
//! decode error is unrecoverable and ends the Channel — and with it, the
//! owning PeerSession.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use super::{message::MessageCodec, Message, PeerError};

pub struct Channel {
    framed: Framed<TcpStream, MessageCodec>,
}

impl Channel {

    pub fn new(stream: TcpStream) -> Self {
        Self { framed: Framed::new(stream, MessageCodec) }
    }

    /// Next decoded message, or `None` on a clean transport close. A decode
    /// or IO error is terminal — the caller must drop the Channel.
    pub async fn recv(&mut self) -> Option<Result<Message, PeerError>> {
        self.framed.next().await
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), PeerError> {
        self.framed.send(msg).await
    }

    /// Flushes and closes the underlying transport.
    pub async fn stop(mut self) {
        let _ = self.framed.close().await;
    }

    /// Any bytes still buffered but not yet decoded into a message — at
    /// most one partial frame, per §4.2's buffer semantics.
    pub fn pending_tail(&self) -> &BytesMut {
        self.framed.read_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_message_over_a_real_socket_pair() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut a = Channel::new(client);
        let mut b = Channel::new(server);

        a.send(Message::Have { index: 7 }).await.unwrap();
        let received = b.recv().await.unwrap().unwrap();
        assert_eq!(received, Message::Have { index: 7 });
    }
}
