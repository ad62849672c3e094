use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{forward_datagram, Connection, DatagramLink, Transport, TransportError, DATAGRAM_QUEUE_DEPTH};

/// Largest datagram the streaming endpoint reads in one call.
pub const MAX_DATAGRAM: usize = 65_536 + 16;

/// TCP control connection plus IPv4 UDP streaming endpoint on tokio sockets.
#[derive(Debug, Clone)]
pub struct TokioTransport {
    bind_addr: Ipv4Addr,
}

impl TokioTransport {
    pub fn new() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Restricts the datagram endpoint to one local interface.
    pub fn with_bind_addr(bind_addr: Ipv4Addr) -> Self {
        Self { bind_addr }
    }
}

impl Default for TokioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TokioTransport {
    async fn connect(&self, peer: SocketAddr) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| TransportError::Connect {
                peer,
                reason: e.to_string(),
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "could not disable nagle");
        }
        Ok(Connection::from_io(peer, stream))
    }

    async fn bind(&self, port: u16) -> Result<DatagramLink, TransportError> {
        let socket = UdpSocket::bind((self.bind_addr, port))
            .await
            .map_err(|e| TransportError::Bind {
                port,
                reason: e.to_string(),
            })?;
        let local_port = socket
            .local_addr()
            .map_err(|e| TransportError::Bind {
                port,
                reason: e.to_string(),
            })?
            .port();

        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE_DEPTH);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, _)) => {
                        if !forward_datagram(&tx, local_port, buf[..len].to_vec()) {
                            break;
                        }
                    }
                    // ICMP errors surface here on some platforms; the socket stays usable.
                    Err(err) => warn!(port = local_port, error = %err, "udp receive error"),
                }
            }
            debug!(port = local_port, "udp reader finished");
        });
        Ok(DatagramLink::new(local_port, rx, Some(reader)))
    }
}
