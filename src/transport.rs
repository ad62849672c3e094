use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, trace, warn};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryRadio, MemoryTransport};
pub use tcp::TokioTransport;

/// Longest control line accepted from the radio.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Datagrams queued between the socket reader and the stream lane.
pub const DATAGRAM_QUEUE_DEPTH: usize = 1024;

/// Errors raised by transport adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect to {peer} failed: {reason}")]
    Connect { peer: SocketAddr, reason: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("bind to udp port {port} failed: {reason}")]
    Bind { port: u16, reason: String },
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed")]
    Closed,
}

/// Notification from the connection reader task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Line(String),
    /// A line was skipped because it was not UTF-8 or was too long. The
    /// connection stays open.
    Undecodable(String),
    Error(TransportError),
    Closed,
}

/// Connection and datagram endpoint factory the session is built on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the control connection.
    async fn connect(&self, peer: SocketAddr) -> Result<Connection, TransportError>;

    /// Binds a receive-only datagram endpoint on `port` (0 picks any port).
    async fn bind(&self, port: u16) -> Result<DatagramLink, TransportError>;
}

type LineSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;

#[derive(Debug, PartialEq, Eq)]
enum ControlLine {
    Text(String),
    Undecodable(String),
}

/// `LinesCodec` that turns per-line decode failures into items, so one bad
/// line does not end the stream.
struct ControlLineCodec {
    lines: LinesCodec,
}

impl ControlLineCodec {
    fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Decoder for ControlLineCodec {
    type Item = ControlLine;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ControlLine>, LinesCodecError> {
        recover_line(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<ControlLine>, LinesCodecError> {
        recover_line(self.lines.decode_eof(buf))
    }
}

// The codec has already consumed (or is discarding) the offending line.
fn recover_line(
    decoded: Result<Option<String>, LinesCodecError>,
) -> Result<Option<ControlLine>, LinesCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(ControlLine::Text)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(ControlLine::Undecodable(
            format!("line longer than {MAX_LINE_LENGTH} bytes"),
        ))),
        Err(LinesCodecError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
            Ok(Some(ControlLine::Undecodable(err.to_string())))
        }
        Err(err) => Err(err),
    }
}

/// Live line-oriented control connection.
///
/// Inbound lines arrive on an event channel fed by a reader task, so the owner
/// can wait on them alongside other work without holding a lock.
pub struct Connection {
    peer: SocketAddr,
    writer: LineSink,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl Connection {
    /// Wraps any byte stream. Must be called inside a tokio runtime.
    pub fn from_io<S>(peer: SocketAddr, io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(read_half, ControlLineCodec::new());
            loop {
                let event = match lines.next().await {
                    Some(Ok(ControlLine::Text(line))) => TransportEvent::Line(line),
                    Some(Ok(ControlLine::Undecodable(reason))) => {
                        warn!(%peer, %reason, "skipping undecodable line");
                        TransportEvent::Undecodable(reason)
                    }
                    Some(Err(err)) => TransportEvent::Error(TransportError::Receive(err.to_string())),
                    None => TransportEvent::Closed,
                };
                let terminal = matches!(event, TransportEvent::Error(_) | TransportEvent::Closed);
                if tx.send(event).is_err() || terminal {
                    break;
                }
            }
            debug!(%peer, "control reader finished");
        });
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        Self {
            peer,
            writer: FramedWrite::new(writer, LinesCodec::new()),
            events,
            reader,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one line; the terminator is appended by the codec.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        trace!(peer = %self.peer, line, "send");
        self.writer
            .send(line)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Next reader event; `None` once the reader is gone and drained.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Flushes and closes the write side and stops the reader.
    pub async fn disconnect(&mut self) {
        if let Err(err) = SinkExt::<&str>::close(&mut self.writer).await {
            debug!(peer = %self.peer, error = %err, "close on disconnect");
        }
        self.reader.abort();
        self.events.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Receive side of the streaming endpoint.
#[derive(Debug)]
pub struct DatagramLink {
    local_port: u16,
    datagrams: mpsc::Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
}

impl DatagramLink {
    /// Builds a link from a datagram channel. `reader` is the task feeding it,
    /// if any, and is stopped with the link.
    pub fn new(
        local_port: u16,
        datagrams: mpsc::Receiver<Vec<u8>>,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            local_port,
            datagrams,
            reader,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.datagrams.recv().await
    }

    pub fn shutdown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.datagrams.close();
    }
}

impl Drop for DatagramLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pushes a datagram without blocking the socket reader; a full queue drops it.
pub(crate) fn forward_datagram(tx: &mpsc::Sender<Vec<u8>>, port: u16, bytes: Vec<u8>) -> bool {
    match tx.try_send(bytes) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(port, "datagram queue full, dropping datagram");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn peer() -> SocketAddr {
        "127.0.0.1:4992".parse().unwrap()
    }

    #[tokio::test]
    async fn lines_flow_both_ways() {
        let (near, far) = tokio::io::duplex(1024);
        let mut conn = Connection::from_io(peer(), near);
        let (far_read, mut far_write) = tokio::io::split(far);

        conn.send_line("1|info").await.unwrap();
        let mut reader = BufReader::new(far_read);
        let mut received = String::new();
        reader.read_line(&mut received).await.unwrap();
        assert_eq!(received, "1|info\n");

        far_write.write_all(b"1|0|model=X\r\nSradio|a=b\n").await.unwrap();
        assert_eq!(
            conn.next_event().await,
            Some(TransportEvent::Line("1|0|model=X".into()))
        );
        assert_eq!(
            conn.next_event().await,
            Some(TransportEvent::Line("Sradio|a=b".into()))
        );
    }

    #[tokio::test]
    async fn bad_lines_are_skipped_without_closing() {
        let (near, far) = tokio::io::duplex(1024);
        let mut conn = Connection::from_io(peer(), near);
        let (_far_read, mut far_write) = tokio::io::split(far);
        tokio::spawn(async move {
            let mut long = vec![b'a'; MAX_LINE_LENGTH + 10];
            long.push(b'\n');
            far_write.write_all(&long).await.unwrap();
            far_write.write_all(b"Sradio|name=\xff\xfe\n1|0|ok\n").await.unwrap();
            far_write
        });

        assert!(matches!(
            conn.next_event().await,
            Some(TransportEvent::Undecodable(reason)) if reason.contains("longer than")
        ));
        assert!(matches!(
            conn.next_event().await,
            Some(TransportEvent::Undecodable(_))
        ));
        assert_eq!(
            conn.next_event().await,
            Some(TransportEvent::Line("1|0|ok".into()))
        );
    }

    #[test]
    fn codec_keeps_decoding_after_invalid_utf8() {
        let mut codec = ControlLineCodec::new();
        let mut buf = BytesMut::from(&b"\xc3\x28\nV1.2\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Ok(Some(ControlLine::Undecodable(_)))
        ));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlLine::Text("V1.2".into()))
        );
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (near, far) = tokio::io::duplex(64);
        let mut conn = Connection::from_io(peer(), near);
        drop(far);
        assert_eq!(conn.next_event().await, Some(TransportEvent::Closed));
    }

    #[tokio::test]
    async fn full_datagram_queue_drops_without_closing() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward_datagram(&tx, 1, vec![1]));
        assert!(forward_datagram(&tx, 1, vec![2]));
        assert_eq!(rx.recv().await, Some(vec![1]));
        drop(rx);
        assert!(!forward_datagram(&tx, 1, vec![3]));
    }
}
