use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::build_info::BuildInfo;
use crate::config::{ConfigError, SessionConfig};
use crate::control::{CommandError, CommandResult, Completion};
use crate::diagnostic::Diagnostic;
use crate::registry::{StatusListener, SubscriptionHandle};
use crate::stream::{
    ConsumerHandle, DemuxStats, GraceSettings, LaneHandle, StreamConsumer, StreamDemux, StreamLane,
};
use crate::transport::{DatagramLink, Transport, TransportError};

mod driver;
pub mod keepalive;
pub mod state;

use driver::{Driver, DriverSettings};
pub use state::{SessionState, SessionStateError};

/// Errors from opening or using a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not reach radio: {0}")]
    Connect(#[source] TransportError),
    #[error("handshake command {command:?} failed: {source}")]
    Handshake {
        command: String,
        #[source]
        source: CommandError,
    },
    #[error("no datagram port available: {0}")]
    Bind(#[source] TransportError),
    #[error(transparent)]
    State(#[from] SessionStateError),
    #[error("session closed")]
    Closed,
}

/// What the radio told us about ourselves and itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadioIdentity {
    /// Client handle from the `H` line.
    pub handle: Option<String>,
    /// Radio version from the `V` line.
    pub version: Option<String>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    identity: Mutex<RadioIdentity>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Disconnected),
            identity: Mutex::new(RadioIdentity::default()),
        }
    }

    fn transition(&self, next: SessionState) -> Result<(), SessionStateError> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        debug!(state = %next, "session state");
        Ok(())
    }

    /// Moves to `next` when legal; teardown paths use this and never fail.
    fn advance(&self, next: SessionState) {
        if let Err(err) = self.transition(next) {
            debug!(error = %err, "state unchanged");
        }
    }
}

enum Request {
    Command {
        text: String,
        diagnostic: bool,
        completion: Completion,
    },
    Subscribe {
        category: String,
        listener: Box<dyn StatusListener>,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        reply: oneshot::Sender<bool>,
    },
    AttachLane(StreamLane),
    StartKeepalive,
    Close {
        reply: oneshot::Sender<()>,
    },
}

impl Request {
    /// Resolves a request the session task will never run.
    fn fail(self) {
        match self {
            Request::Command { completion, .. } => {
                completion.deliver(Err(CommandError::SessionClosed))
            }
            Request::Close { reply } => {
                let _ = reply.send(());
            }
            // Dropping the reply sender resolves the waiter as closed.
            Request::Subscribe { .. }
            | Request::Unsubscribe { .. }
            | Request::AttachLane(_)
            | Request::StartKeepalive => {}
        }
    }
}

/// Handle to one radio session.
///
/// Commands, subscriptions and teardown are executed by a dedicated session
/// task; this handle only submits requests to it, so every method takes
/// `&self` and the handle can be shared behind an `Arc`.
///
/// # Guarantees
/// * Every command resolves exactly once: with its reply, a rejection, a
///   timeout or [`CommandError::SessionClosed`].
/// * After [`close`](Self::close) returns, no listener or stream consumer is
///   invoked again and the sockets are released.
#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
    lane: Option<LaneHandle>,
    diagnostics: Mutex<Option<mpsc::UnboundedReceiver<Diagnostic>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Request::Command { .. } => "Command",
            Request::Subscribe { .. } => "Subscribe",
            Request::Unsubscribe { .. } => "Unsubscribe",
            Request::AttachLane(_) => "AttachLane",
            Request::StartKeepalive => "StartKeepalive",
            Request::Close { .. } => "Close",
        };
        f.write_str(name)
    }
}

impl Session {
    /// Connects to `peer`, runs the handshake and arms streaming.
    ///
    /// # Errors
    /// * [`SessionError::Connect`] when the connection is refused or does not
    ///   complete within the connect timeout.
    /// * [`SessionError::Handshake`] naming the first handshake command that
    ///   did not succeed. The session is torn down before this returns.
    /// * [`SessionError::Bind`] when no candidate datagram port could be bound.
    pub async fn open(
        peer: SocketAddr,
        config: SessionConfig,
        build: BuildInfo,
        transport: &dyn Transport,
    ) -> Result<Session, SessionError> {
        config.validate()?;
        let shared = Arc::new(Shared::new());
        shared.transition(SessionState::Connecting)?;
        info!(%peer, client = %build, "connecting to radio");

        let connection = match timeout(config.connect_timeout(), transport.connect(peer)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                shared.advance(SessionState::Disconnected);
                return Err(SessionError::Connect(err));
            }
            Err(_) => {
                shared.advance(SessionState::Disconnected);
                return Err(SessionError::Connect(TransportError::Connect {
                    peer,
                    reason: format!("timed out after {:?}", config.connect_timeout()),
                }));
            }
        };
        shared.transition(SessionState::Authenticating)?;

        let (requests, request_rx) = mpsc::unbounded_channel();
        let (diagnostics, diagnostics_rx) = mpsc::unbounded_channel();
        let settings = DriverSettings {
            dialect: config.dialect,
            command_timeout: config.command_timeout(),
            keepalive_interval: config.keepalive_interval(),
            keepalive_timeout: config.keepalive_timeout(),
            max_protocol_violations: config.max_protocol_violations,
            sweep_interval: config.sweep_interval(),
        };
        let driver = Driver::new(
            settings,
            connection,
            request_rx,
            shared.clone(),
            diagnostics.clone(),
        );
        let task = tokio::spawn(driver.run());

        let mut session = Session {
            peer,
            requests,
            shared,
            lane: None,
            diagnostics: Mutex::new(Some(diagnostics_rx)),
            driver: Mutex::new(Some(task)),
        };

        let armed = session
            .arm(&config, &build, transport, diagnostics)
            .await
            .and_then(|()| Ok(session.shared.transition(SessionState::Active)?));
        if let Err(err) = armed {
            warn!(%peer, error = %err, "session open failed");
            session.close().await;
            return Err(err);
        }
        info!(%peer, "session active");
        Ok(session)
    }

    async fn arm(
        &mut self,
        config: &SessionConfig,
        build: &BuildInfo,
        transport: &dyn Transport,
        diagnostics: mpsc::UnboundedSender<Diagnostic>,
    ) -> Result<(), SessionError> {
        if config.announce_client {
            self.announce_client(build).await?;
        }
        for command in &config.handshake_commands {
            self.handshake(command.clone()).await?;
        }

        let link = bind_stream_port(transport, config).await?;
        let port = link.local_port();
        debug!(port, "datagram endpoint bound");
        let demux = StreamDemux::new(
            GraceSettings {
                period: config.stream_grace(),
                capacity: config.stream_grace_capacity,
            },
            config.stream_inactivity(),
        );
        let lane = StreamLane::spawn(link, demux, config.sweep_interval(), diagnostics);
        self.lane = Some(lane.handle());
        self.requests
            .send(Request::AttachLane(lane))
            .map_err(|_| SessionError::Closed)?;
        if config.announce_udp_port {
            self.handshake(format!("client udpport {port}")).await?;
        }

        if config.keepalive {
            self.handshake(keepalive::ENABLE.to_string()).await?;
            self.requests
                .send(Request::StartKeepalive)
                .map_err(|_| SessionError::Closed)?;
        }
        Ok(())
    }

    /// Some radios reject `client program`; only a lost reply aborts open.
    async fn announce_client(&self, build: &BuildInfo) -> Result<(), SessionError> {
        let command = format!("client program {}", build.program_token());
        match self.send_command(command.as_str()).await {
            Ok(_) => Ok(()),
            Err(CommandError::Rejected { code, payload }) => {
                warn!(%command, code, %payload, "radio rejected client announcement");
                Ok(())
            }
            Err(source) => Err(SessionError::Handshake { command, source }),
        }
    }

    async fn handshake(&self, command: String) -> Result<(), SessionError> {
        match self.send_command(command.as_str()).await {
            Ok(_) => Ok(()),
            Err(source) => Err(SessionError::Handshake { command, source }),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn identity(&self) -> RadioIdentity {
        self.shared.identity.lock().clone()
    }

    /// Local port the radio should stream to.
    pub fn udp_port(&self) -> Option<u16> {
        self.lane.as_ref().map(LaneHandle::local_port)
    }

    /// Sends a command and waits for its outcome.
    pub async fn send_command(&self, text: impl Into<String>) -> CommandResult {
        let (tx, rx) = oneshot::channel();
        self.submit(text.into(), false, Completion::Channel(tx));
        rx.await.unwrap_or(Err(CommandError::SessionClosed))
    }

    /// Like [`send_command`](Self::send_command), flagged as a diagnostic
    /// command in the tagged dialect.
    pub async fn send_diagnostic_command(&self, text: impl Into<String>) -> CommandResult {
        let (tx, rx) = oneshot::channel();
        self.submit(text.into(), true, Completion::Channel(tx));
        rx.await.unwrap_or(Err(CommandError::SessionClosed))
    }

    /// Sends a command; `callback` runs on the session task with the outcome.
    pub fn send_command_with<F>(&self, text: impl Into<String>, callback: F)
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        self.submit(text.into(), false, Completion::Callback(Box::new(callback)));
    }

    fn submit(&self, text: String, diagnostic: bool, completion: Completion) {
        let request = Request::Command {
            text,
            diagnostic,
            completion,
        };
        if let Err(mpsc::error::SendError(request)) = self.requests.send(request) {
            request.fail();
        }
    }

    /// Registers `listener` for status events of `category` (`*` for all).
    pub async fn subscribe(
        &self,
        category: impl Into<String>,
        listener: impl StatusListener + 'static,
    ) -> Result<SubscriptionHandle, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Subscribe {
                category: category.into(),
                listener: Box::new(listener),
                reply,
            })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Returns `false` when the subscription was already gone.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Unsubscribe { handle, reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn register_stream_consumer(
        &self,
        stream_id: u16,
        consumer: impl StreamConsumer + 'static,
    ) -> Result<ConsumerHandle, SessionError> {
        let lane = self.lane.as_ref().ok_or(SessionError::Closed)?;
        lane.register(stream_id, Box::new(consumer))
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn unregister_stream_consumer(
        &self,
        handle: ConsumerHandle,
    ) -> Result<bool, SessionError> {
        let lane = self.lane.as_ref().ok_or(SessionError::Closed)?;
        lane.unregister(handle).await.map_err(|_| SessionError::Closed)
    }

    pub fn stream_stats(&self) -> DemuxStats {
        self.lane
            .as_ref()
            .map(LaneHandle::stats)
            .unwrap_or_default()
    }

    /// The diagnostic channel. Only the first call returns it.
    pub fn take_diagnostics(&self) -> Option<mpsc::UnboundedReceiver<Diagnostic>> {
        self.diagnostics.lock().take()
    }

    /// Ends the session and waits until teardown is complete.
    ///
    /// Pending commands resolve with [`CommandError::SessionClosed`]. Calling
    /// this on a session that already ended returns immediately.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Close { reply }).is_ok() {
            let _ = rx.await;
        }
        let task = self.driver.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(peer = %self.peer, error = %err, "session task ended abnormally");
            }
        }
    }
}

async fn bind_stream_port(
    transport: &dyn Transport,
    config: &SessionConfig,
) -> Result<DatagramLink, SessionError> {
    let mut last_error = None;
    for port in config.udp_candidate_ports() {
        match transport.bind(port).await {
            Ok(link) => return Ok(link),
            Err(err) => {
                debug!(port, error = %err, "datagram port unavailable");
                last_error = Some(err);
            }
        }
    }
    Err(SessionError::Bind(last_error.unwrap_or(TransportError::Bind {
        port: config.udp_port,
        reason: "no candidate ports".into(),
    })))
}
