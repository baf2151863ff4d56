//! TCP transport for peer messages.
//!
//! Every message on the wire is one length-prefixed JSON frame:
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: JSON Message]
//! ```
//!
//! The reader checks the announced length against the configured maximum
//! before allocating, so an oversized frame costs nothing but the header
//! and drops the connection. A reader task per connection decodes frames
//! into [`TransportEvent`]s on a single channel; a writer task per
//! connection drains an outbound queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::message::Message;

/// Local handle for one live connection.
pub type PeerId = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no connection {0}")]
    UnknownPeer(PeerId),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
}

/// What the transport reports to the node loop.
#[derive(Debug)]
pub enum TransportEvent {
    Connected { peer: PeerId, addr: SocketAddr },
    Message { peer: PeerId, message: Message },
    Disconnected { peer: PeerId },
}

/// Cloneable handle to the connection table.
#[derive(Clone)]
pub struct Transport {
    peers: Arc<Mutex<HashMap<PeerId, mpsc::Sender<Arc<[u8]>>>>>,
    events: mpsc::Sender<TransportEvent>,
    next_id: Arc<AtomicU64>,
    max_frame_bytes: usize,
    queue_len: usize,
}

impl Transport {
    /// Binds `addr` and starts accepting connections.
    ///
    /// Returns the handle, the bound address and the event receiver.
    pub async fn bind(
        addr: SocketAddr,
        max_frame_bytes: usize,
        queue_len: usize,
    ) -> Result<(Self, SocketAddr, mpsc::Receiver<TransportEvent>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "p2p transport listening");

        let (events, rx) = mpsc::channel(queue_len.max(1));
        let transport = Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            max_frame_bytes,
            queue_len: queue_len.max(1),
        };

        let acceptor = transport.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted peer connection");
                        acceptor.register(stream, remote).await;
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });

        Ok((transport, local_addr, rx))
    }

    /// Dials `addr` (`host:port`) and registers the connection.
    pub async fn connect(&self, addr: &str) -> Result<PeerId, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let remote = stream.peer_addr()?;
        debug!(%remote, "connected to peer");
        Ok(self.register(stream, remote).await)
    }

    async fn register(&self, stream: TcpStream, addr: SocketAddr) -> PeerId {
        let peer = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.queue_len);
        self.peers.lock().await.insert(peer, tx);

        tokio::spawn(write_loop(peer, write_half, rx));
        let reader = self.clone();
        tokio::spawn(async move {
            reader.read_loop(peer, read_half).await;
            reader.peers.lock().await.remove(&peer);
            let _ = reader.events.send(TransportEvent::Disconnected { peer }).await;
        });

        let _ = self.events.send(TransportEvent::Connected { peer, addr }).await;
        peer
    }

    async fn read_loop(&self, peer: PeerId, mut read_half: OwnedReadHalf) {
        loop {
            let len = match read_half.read_u32_le().await {
                Ok(len) => len as usize,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        debug!(peer, error = %e, "read failed");
                    }
                    break;
                }
            };
            if len > self.max_frame_bytes {
                warn!(peer, len, max = self.max_frame_bytes, "oversized frame, dropping connection");
                break;
            }
            let mut payload = vec![0u8; len];
            if let Err(e) = read_half.read_exact(&mut payload).await {
                debug!(peer, error = %e, "truncated frame");
                break;
            }
            match Message::from_json_slice(&payload) {
                Ok(message) => {
                    if self.events.send(TransportEvent::Message { peer, message }).await.is_err() {
                        break;
                    }
                }
                // Malformed input is dropped; the connection stays up.
                Err(e) => debug!(peer, error = %e, "undecodable message dropped"),
            }
        }
        debug!(peer, "connection closed");
    }

    /// Length prefix plus JSON payload.
    fn encode_frame(&self, msg: &Message) -> Result<Arc<[u8]>, TransportError> {
        let payload = msg.to_json()?.into_bytes();
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|&len| len as usize <= self.max_frame_bytes)
            .ok_or(TransportError::Oversized {
                len: payload.len(),
                max: self.max_frame_bytes,
            })?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame.into())
    }

    /// Queues `msg` for one connection.
    pub async fn send(&self, peer: PeerId, msg: &Message) -> Result<(), TransportError> {
        let frame = self.encode_frame(msg)?;
        let tx = self
            .peers
            .lock()
            .await
            .get(&peer)
            .cloned()
            .ok_or(TransportError::UnknownPeer(peer))?;
        if tx.send(frame).await.is_err() {
            self.peers.lock().await.remove(&peer);
            return Err(TransportError::UnknownPeer(peer));
        }
        Ok(())
    }

    /// Queues `msg` for every connection. Returns how many accepted it.
    pub async fn broadcast(&self, msg: &Message) -> Result<usize, TransportError> {
        let frame = self.encode_frame(msg)?;
        let targets: Vec<(PeerId, mpsc::Sender<Arc<[u8]>>)> = self
            .peers
            .lock()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut sent = 0;
        let mut dead = Vec::new();
        for (peer, tx) in targets {
            match tx.try_send(Arc::clone(&frame)) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer, kind = msg.kind(), "peer queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(peer),
            }
        }
        if !dead.is_empty() {
            let mut peers = self.peers.lock().await;
            for peer in dead {
                peers.remove(&peer);
            }
        }
        Ok(sent)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

async fn write_loop(peer: PeerId, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Arc<[u8]>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            debug!(peer, error = %e, "write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::p2p::message::RoundAnnouncement;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    async fn next_message(rx: &mut mpsc::Receiver<TransportEvent>) -> (PeerId, Message) {
        loop {
            match rx.recv().await.expect("event") {
                TransportEvent::Message { peer, message } => return (peer, message),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn messages_cross_a_connection_both_ways() {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let (a, _, mut a_rx) = Transport::bind(any, 1 << 20, 16).await.expect("bind a");
        let (b, b_addr, mut b_rx) = Transport::bind(any, 1 << 20, 16).await.expect("bind b");

        let wallet = Wallet::generate(&mut StdRng::seed_from_u64(1));
        let msg = Message::Round(RoundAnnouncement::new(&wallet, 3));

        let to_b = a.connect(&b_addr.to_string()).await.expect("connect");
        a.send(to_b, &msg).await.expect("send");
        let (from_a, got) = next_message(&mut b_rx).await;
        assert_eq!(got, msg);

        b.send(from_a, &msg).await.expect("reply");
        let (_, got) = next_message(&mut a_rx).await;
        assert_eq!(got, msg);
        assert_eq!(a.broadcast(&msg).await.expect("broadcast"), 1);
    }

    #[tokio::test]
    async fn sending_to_unknown_peer_fails() {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let (a, _, _rx) = Transport::bind(any, 1 << 20, 4).await.expect("bind");
        let wallet = Wallet::generate(&mut StdRng::seed_from_u64(2));
        let msg = Message::Round(RoundAnnouncement::new(&wallet, 1));
        assert!(matches!(a.send(42, &msg).await, Err(TransportError::UnknownPeer(42))));
    }

    async fn next_disconnect(rx: &mut mpsc::Receiver<TransportEvent>) -> PeerId {
        loop {
            match rx.recv().await.expect("event") {
                TransportEvent::Disconnected { peer } => return peer,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn oversized_frame_drops_the_connection() {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let (a, a_addr, mut a_rx) = Transport::bind(any, 64, 4).await.expect("bind");

        let mut raw = TcpStream::connect(a_addr).await.expect("dial");
        // Header only: the announced payload is never sent or allocated.
        raw.write_u32_le(u32::MAX).await.expect("header");
        next_disconnect(&mut a_rx).await;
        assert_eq!(a.peer_count().await, 0);
    }

    #[tokio::test]
    async fn garbage_frame_is_skipped_and_the_next_one_decoded() {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let (_a, a_addr, mut a_rx) = Transport::bind(any, 1 << 20, 4).await.expect("bind");
        let wallet = Wallet::generate(&mut StdRng::seed_from_u64(3));
        let msg = Message::Round(RoundAnnouncement::new(&wallet, 5));

        let mut raw = TcpStream::connect(a_addr).await.expect("dial");
        for payload in [b"not json".to_vec(), msg.to_json().expect("encode").into_bytes()] {
            raw.write_u32_le(payload.len() as u32).await.expect("header");
            raw.write_all(&payload).await.expect("payload");
        }
        let (_, got) = next_message(&mut a_rx).await;
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn outbound_frames_respect_the_limit() {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let (a, _, _rx) = Transport::bind(any, 16, 4).await.expect("bind");
        let wallet = Wallet::generate(&mut StdRng::seed_from_u64(4));
        let msg = Message::Round(RoundAnnouncement::new(&wallet, 1));
        assert!(matches!(a.broadcast(&msg).await, Err(TransportError::Oversized { max: 16, .. })));
    }
}
