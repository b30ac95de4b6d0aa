//! Connection endpoint plumbing shared by the server and the client.
//!
//! A [`Connection`] owns the write side of one TCP stream. Every outbound
//! packet goes through a single queue drained by a dedicated writer task, so
//! application sends, relayed packets and internally generated notices never
//! interleave on the wire. The read side is handed back as a [`FrameReader`]
//! for the owner's read loop, which pulls frames with [`Connection::read`].
//!
//! Teardown is one-shot: the first [`Connection::close`] queues an optional
//! farewell followed by a shutdown marker; the writer then shuts the socket
//! down and cancels the connection's token, which ends the read loop and any
//! timer tied to the connection.
//!
//! A packet too large to encode is dropped on its own; only a failed write
//! ends the connection.

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{HazeCodec, Inbound};
use crate::error::{CodecError, ConnectionError};
use crate::packet::Packet;

pub type FrameReader = FramedRead<OwnedReadHalf, HazeCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, HazeCodec>;

#[derive(Debug)]
enum Outbound {
    Packet {
        packet: Packet,
        flushed: Option<FlushedSender>,
    },
    Shutdown,
}

type FlushedSender = oneshot::Sender<Result<(), CodecError>>;

/// Result of waiting for the next inbound frame.
#[derive(Debug)]
pub enum ReadEvent {
    Frame(Inbound),
    /// The stream produced bytes that cannot be trusted
    Violation(CodecError),
    /// The peer closed its side of the stream
    Eof,
    /// The connection was closed locally
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    closed: AtomicBool,
    detached: bool,
    opened_at: Instant,
}

impl Connection {
    /// Splits the stream and starts the writer task.
    pub fn open(stream: TcpStream) -> io::Result<(Connection, FrameReader)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, HazeCodec::new()),
            outbound_rx,
            cancel.clone(),
            peer_addr,
        ));

        let connection = Connection {
            inner: Arc::new(Inner {
                peer_addr,
                outbound,
                cancel,
                closed: AtomicBool::new(false),
                detached: false,
                opened_at: Instant::now(),
            }),
        };

        Ok((connection, FramedRead::new(read_half, HazeCodec::new())))
    }

    /// A connection with no socket behind it. Everything sent on it lands in
    /// the returned [`Outbox`], which makes roster and relay logic drivable
    /// without a network.
    pub fn detached(peer_addr: SocketAddr) -> (Connection, Outbox) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            inner: Arc::new(Inner {
                peer_addr,
                outbound,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                detached: true,
                opened_at: Instant::now(),
            }),
        };
        (
            connection,
            Outbox {
                queue: outbound_rx,
                shut_down: false,
            },
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn connected_for(&self) -> Duration {
        self.inner.opened_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled once the connection is fully torn down.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Queues a packet for sending.
    pub fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.enqueue(packet, None)
    }

    /// Queues a packet and waits until the writer has put it on the wire.
    pub async fn send_flushed(&self, packet: Packet) -> Result<(), ConnectionError> {
        let (flushed_tx, flushed_rx) = oneshot::channel();
        self.enqueue(packet, Some(flushed_tx))?;
        flushed_rx.await.map_err(|_| ConnectionError::Closed)??;
        Ok(())
    }

    fn enqueue(&self, packet: Packet, flushed: Option<FlushedSender>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.inner
            .outbound
            .send(Outbound::Packet { packet, flushed })
            .map_err(|_| ConnectionError::Closed)
    }

    /// Tears the connection down. With a farewell, the peer is sent a
    /// `Disconnect` carrying it before the stream closes.
    ///
    /// Returns true only for the call that actually performed the teardown.
    pub fn close(&self, farewell: Option<String>) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(reason) = farewell {
            let _ = self.inner.outbound.send(Outbound::Packet {
                packet: Packet::disconnect(reason),
                flushed: None,
            });
        }

        // Writer already gone: nothing left to flush.
        if self.inner.outbound.send(Outbound::Shutdown).is_err() || self.inner.detached {
            self.inner.cancel.cancel();
        }
        true
    }

    /// Waits for the next frame, or for the connection to be closed locally.
    pub async fn read(&self, reader: &mut FrameReader) -> ReadEvent {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => ReadEvent::Cancelled,
            next = reader.next() => match next {
                Some(Ok(frame)) => ReadEvent::Frame(frame),
                Some(Err(e)) => ReadEvent::Violation(e),
                None => ReadEvent::Eof,
            },
        }
    }
}

async fn write_loop(
    mut sink: FrameWriter,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    peer_addr: SocketAddr,
) {
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Packet { packet, flushed }) => {
                    let description = packet.describe();
                    let result = match sink.send(packet).await {
                        Ok(()) => {
                            debug!("Sent {} to {}", description, peer_addr);
                            Ok(())
                        }
                        Err(CodecError::Io(e)) => {
                            warn!("Failed to send {} to {}: {}", description, peer_addr, e);
                            break;
                        }
                        // Encoding failed before anything was written.
                        Err(e) => {
                            warn!("Dropping {} to {}: {}", description, peer_addr, e);
                            Err(e)
                        }
                    };
                    if let Some(flushed) = flushed {
                        let _ = flushed.send(result);
                    }
                }
                Some(Outbound::Shutdown) | None => {
                    if let Err(e) = sink.close().await {
                        debug!("Error closing stream to {}: {}", peer_addr, e);
                    }
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }

    cancel.cancel();
}

/// Receiving end of a detached connection.
#[derive(Debug)]
pub struct Outbox {
    queue: mpsc::UnboundedReceiver<Outbound>,
    shut_down: bool,
}

impl Outbox {
    /// Next packet sent on the connection, if any is waiting.
    pub fn try_next(&mut self) -> Option<Packet> {
        while let Ok(command) = self.queue.try_recv() {
            match command {
                Outbound::Packet { packet, flushed } => {
                    if let Some(flushed) = flushed {
                        let _ = flushed.send(Ok(()));
                    }
                    return Some(packet);
                }
                Outbound::Shutdown => self.shut_down = true,
            }
        }
        None
    }

    /// Whether draining the outbox has reached the connection's shutdown.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn drain(&mut self) -> Vec<Packet> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBody;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_packets_arrive_in_send_order() {
        let (local, remote) = socket_pair().await;
        let (connection, _reader) = Connection::open(local).unwrap();
        let mut remote = FramedRead::new(remote, HazeCodec::new());

        for i in 0..10 {
            connection.send(Packet::text(format!("msg {i}"))).unwrap();
        }

        for i in 0..10 {
            match remote.next().await {
                Some(Ok(Inbound::Packet(packet))) => match packet.body() {
                    PacketBody::Text { text } => assert_eq!(text, &format!("msg {i}")),
                    _ => panic!("Wrong packet type"),
                },
                other => panic!("Unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, remote) = socket_pair().await;
        let (connection, _reader) = Connection::open(local).unwrap();
        let mut remote = FramedRead::new(remote, HazeCodec::new());

        assert!(connection.close(Some("done".to_string())));
        assert!(!connection.close(Some("again".to_string())));
        assert!(connection.is_closed());

        match remote.next().await {
            Some(Ok(Inbound::Packet(packet))) => match packet.body() {
                PacketBody::Disconnect { reason } => assert_eq!(reason, "done"),
                _ => panic!("Wrong packet type"),
            },
            other => panic!("Unexpected frame: {other:?}"),
        }
        assert!(remote.next().await.is_none());

        timeout(Duration::from_secs(2), connection.cancellation().cancelled())
            .await
            .expect("teardown should cancel the connection token");
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (local, _remote) = socket_pair().await;
        let (connection, _reader) = Connection::open(local).unwrap();

        connection.close(None);
        assert!(matches!(
            connection.send(Packet::text("too late")),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_reports_local_close() {
        let (local, _remote) = socket_pair().await;
        let (connection, mut reader) = Connection::open(local).unwrap();

        connection.close(None);
        let event = timeout(Duration::from_secs(2), connection.read(&mut reader))
            .await
            .unwrap();
        assert!(matches!(event, ReadEvent::Cancelled));
    }

    #[tokio::test]
    async fn test_read_reports_violation() {
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = socket_pair().await;
        let (connection, mut reader) = Connection::open(local).unwrap();

        // Valid length prefix, garbage body.
        remote.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();

        let event = timeout(Duration::from_secs(2), connection.read(&mut reader))
            .await
            .unwrap();
        match event {
            ReadEvent::Violation(e) => assert!(e.is_fatal()),
            other => panic!("Unexpected read event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_flushed_resolves() {
        let (local, _remote) = socket_pair().await;
        let (connection, _reader) = Connection::open(local).unwrap();

        let flushed = timeout(Duration::from_secs(2), connection.send_flushed(Packet::ping()))
            .await
            .unwrap();
        tokio_test::assert_ok!(flushed);
    }

    #[test]
    fn test_detached_outbox() {
        let (connection, mut outbox) = Connection::detached(test_addr());

        connection.send(Packet::text("one")).unwrap();
        assert_eq!(outbox.try_next().map(|p| p.kind()), Some(crate::PacketKind::Text));
        assert!(outbox.try_next().is_none());
        assert!(!outbox.is_shut_down());

        assert!(connection.close(Some("bye".to_string())));
        assert!(connection.cancellation().is_cancelled());
        let drained = outbox.drain();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0].body(), PacketBody::Disconnect { reason } if reason == "bye"));
        assert!(outbox.is_shut_down());
    }

    #[test]
    fn test_silent_close_is_visible_in_outbox() {
        let (connection, mut outbox) = Connection::detached(test_addr());

        assert!(connection.close(None));
        assert!(outbox.drain().is_empty());
        assert!(outbox.is_shut_down());
    }

    #[tokio::test]
    async fn test_oversized_packet_is_dropped_alone() {
        let (local, remote) = socket_pair().await;
        let (connection, _reader) = Connection::open(local).unwrap();
        let mut remote = FramedRead::new(remote, HazeCodec::new());

        let too_large = Packet::raw(vec![0; crate::MAX_FRAME_LENGTH]);
        let result = timeout(Duration::from_secs(5), connection.send_flushed(too_large))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::Codec(CodecError::Oversized { .. }))
        ));

        connection.send(Packet::text("still here")).unwrap();
        match timeout(Duration::from_secs(2), remote.next()).await.unwrap() {
            Some(Ok(Inbound::Packet(packet))) => {
                assert!(matches!(packet.body(), PacketBody::Text { text } if text == "still here"))
            }
            other => panic!("Unexpected frame: {other:?}"),
        }
        assert!(!connection.is_closed());
        assert!(!connection.cancellation().is_cancelled());
    }
}
