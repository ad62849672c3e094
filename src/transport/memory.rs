//! In-process transport for tests and demos.
//!
//! `MemoryTransport` hands the session one end of a duplex pipe and gives the
//! other end to a [`MemoryRadio`], which plays the device: it reads command
//! lines, writes replies and status, and injects datagrams into whatever port
//! the session bound.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use super::{Connection, DatagramLink, Transport, TransportError, DATAGRAM_QUEUE_DEPTH, MAX_LINE_LENGTH};

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_EPHEMERAL_PORT: u16 = 49_152;

#[derive(Debug)]
struct Shared {
    controls: mpsc::UnboundedSender<RadioControl>,
    datagrams: mpsc::UnboundedSender<DatagramInjector>,
    refuse: AtomicBool,
    occupied: Mutex<HashSet<u16>>,
    next_ephemeral: AtomicU16,
}

/// Transport whose peer is an in-process [`MemoryRadio`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Device side of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryRadio {
    controls: mpsc::UnboundedReceiver<RadioControl>,
    datagrams: mpsc::UnboundedReceiver<DatagramInjector>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryRadio) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport {
            shared: Arc::new(Shared {
                controls: control_tx,
                datagrams: datagram_tx,
                refuse: AtomicBool::new(false),
                occupied: Mutex::new(HashSet::new()),
                next_ephemeral: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        };
        let radio = MemoryRadio {
            controls: control_rx,
            datagrams: datagram_rx,
        };
        (transport, radio)
    }

    /// Makes subsequent connects fail as if the device refused them.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Marks a UDP port as taken so binds to it fail.
    pub fn occupy_port(&self, port: u16) {
        self.shared.occupied.lock().insert(port);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer: SocketAddr) -> Result<Connection, TransportError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                peer,
                reason: "connection refused".into(),
            });
        }
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let control = RadioControl {
            lines: Framed::new(far, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        };
        self.shared
            .controls
            .send(control)
            .map_err(|_| TransportError::Connect {
                peer,
                reason: "no radio listening".into(),
            })?;
        Ok(Connection::from_io(peer, near))
    }

    async fn bind(&self, port: u16) -> Result<DatagramLink, TransportError> {
        let port = if port == 0 {
            self.shared.next_ephemeral.fetch_add(1, Ordering::SeqCst)
        } else {
            port
        };
        {
            let mut occupied = self.shared.occupied.lock();
            if !occupied.insert(port) {
                return Err(TransportError::Bind {
                    port,
                    reason: "address in use".into(),
                });
            }
        }
        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE_DEPTH);
        self.shared
            .datagrams
            .send(DatagramInjector { port, tx })
            .map_err(|_| TransportError::Bind {
                port,
                reason: "no radio listening".into(),
            })?;
        Ok(DatagramLink::new(port, rx, None))
    }
}

impl MemoryRadio {
    /// Waits for the next control connection.
    pub async fn accept(&mut self) -> Option<RadioControl> {
        self.controls.recv().await
    }

    /// Waits for the next datagram endpoint the client binds.
    pub async fn datagram_endpoint(&mut self) -> Option<DatagramInjector> {
        self.datagrams.recv().await
    }
}

/// Device end of a control connection.
#[derive(Debug)]
pub struct RadioControl {
    lines: Framed<DuplexStream, LinesCodec>,
}

impl RadioControl {
    /// Next line written by the client; `None` once the client hung up.
    pub async fn recv_line(&mut self) -> Option<String> {
        match self.lines.next().await {
            Some(Ok(line)) => Some(line),
            _ => None,
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.lines
            .send(line)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// Injects datagrams into a bound client endpoint.
#[derive(Debug, Clone)]
pub struct DatagramInjector {
    port: u16,
    tx: mpsc::Sender<Vec<u8>>,
}

impl DatagramInjector {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Delivers a datagram; errors once the client endpoint is gone.
    pub async fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.tx
            .send(bytes.into())
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;

    fn peer() -> SocketAddr {
        "10.0.0.5:4992".parse().unwrap()
    }

    #[tokio::test]
    async fn control_lines_reach_the_radio() {
        let (transport, mut radio) = MemoryTransport::pair();
        let mut conn = transport.connect(peer()).await.unwrap();
        let mut control = radio.accept().await.unwrap();

        conn.send_line("1|version").await.unwrap();
        assert_eq!(control.recv_line().await.as_deref(), Some("1|version"));

        control.send_line("1|0|v=1").await.unwrap();
        assert_eq!(
            conn.next_event().await,
            Some(TransportEvent::Line("1|0|v=1".into()))
        );
    }

    #[tokio::test]
    async fn refused_connections() {
        let (transport, _radio) = MemoryTransport::pair();
        transport.set_refuse_connections(true);
        assert!(matches!(
            transport.connect(peer()).await,
            Err(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn occupied_ports_fail_to_bind() {
        let (transport, mut radio) = MemoryTransport::pair();
        transport.occupy_port(4991);
        assert!(matches!(
            transport.bind(4991).await,
            Err(TransportError::Bind { port: 4991, .. })
        ));
        let mut link = transport.bind(4992).await.unwrap();
        let injector = radio.datagram_endpoint().await.unwrap();
        assert_eq!(injector.port(), 4992);
        injector.send(vec![9u8, 9]).await.unwrap();
        assert_eq!(link.recv().await, Some(vec![9, 9]));
    }
}
