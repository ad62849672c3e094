use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::build_info::BuildInfo;
use crate::config::SessionConfig;
use crate::control::CommandError;
use crate::diagnostic::Diagnostic;
use crate::protocol::{parse_key_values, Reply};
use crate::registry::{StatusListener, SubscriptionHandle};
use crate::session::{RadioIdentity, Session, SessionError, SessionState};
use crate::stream::{ConsumerHandle, DemuxStats, StreamConsumer};
use crate::transport::{TokioTransport, Transport};

/// Errors emitted by the high-level client.
///
/// `Session` covers opening and session-wide failures, `Command` a single
/// command the radio refused or never answered, and `Reply` a successful
/// reply whose payload did not have the expected shape.
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientError {
    Session(SessionError),
    Command(CommandError),
    Reply { command: String, reason: String },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Session(err) => write!(f, "session error: {}", err),
            ClientError::Command(err) => write!(f, "command error: {}", err),
            ClientError::Reply { command, reason } => {
                write!(f, "unexpected reply to {:?}: {}", command, reason)
            }
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Session(err) => Some(err),
            ClientError::Command(err) => Some(err),
            ClientError::Reply { .. } => None,
        }
    }
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        ClientError::Session(err)
    }
}

impl From<CommandError> for ClientError {
    fn from(err: CommandError) -> Self {
        ClientError::Command(err)
    }
}

/// Radio controller client: a [`Session`] plus typed queries.
///
/// # Guarantees
/// * `open` returns only once the handshake succeeded and the datagram port
///   was announced.
/// * Query helpers never retry; a timeout surfaces as
///   `ClientError::Command(CommandError::Timeout)`.
#[derive(Debug)]
pub struct RadioClient {
    session: Session,
}

impl RadioClient {
    /// Connects over TCP/UDP with the default configuration.
    pub async fn open(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::open_with(
            addr,
            SessionConfig::default(),
            BuildInfo::current(),
            &TokioTransport::new(),
        )
        .await
    }

    /// # Errors
    /// Returns `ClientError::Session` when the connection, handshake or
    /// datagram bind fails.
    pub async fn open_with(
        addr: SocketAddr,
        config: SessionConfig,
        build: BuildInfo,
        transport: &dyn Transport,
    ) -> Result<Self, ClientError> {
        let session = Session::open(addr, config, build, transport).await?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn identity(&self) -> RadioIdentity {
        self.session.identity()
    }

    pub async fn send_command(&self, text: impl Into<String>) -> Result<Reply, ClientError> {
        Ok(self.session.send_command(text).await?)
    }

    pub async fn subscribe(
        &self,
        category: impl Into<String>,
        listener: impl StatusListener + 'static,
    ) -> Result<SubscriptionHandle, ClientError> {
        Ok(self.session.subscribe(category, listener).await?)
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, ClientError> {
        Ok(self.session.unsubscribe(handle).await?)
    }

    pub async fn register_stream_consumer(
        &self,
        stream_id: u16,
        consumer: impl StreamConsumer + 'static,
    ) -> Result<ConsumerHandle, ClientError> {
        Ok(self
            .session
            .register_stream_consumer(stream_id, consumer)
            .await?)
    }

    pub async fn unregister_stream_consumer(
        &self,
        handle: ConsumerHandle,
    ) -> Result<bool, ClientError> {
        Ok(self.session.unregister_stream_consumer(handle).await?)
    }

    pub fn stream_stats(&self) -> DemuxStats {
        self.session.stream_stats()
    }

    /// The diagnostic channel; `None` after the first call.
    pub fn diagnostics(&self) -> Option<mpsc::UnboundedReceiver<Diagnostic>> {
        self.session.take_diagnostics()
    }

    /// Radio description from `info`, with quotes stripped from values.
    pub async fn info(&self) -> Result<HashMap<String, String>, ClientError> {
        let reply = self.send_command("info").await?;
        Ok(parse_info(&reply.payload))
    }

    /// Component versions from `version` (`#`-separated pairs).
    pub async fn version(&self) -> Result<HashMap<String, String>, ClientError> {
        let reply = self.send_command("version").await?;
        Ok(parse_key_values(&reply.payload, '#').into_iter().collect())
    }

    /// Seconds since the radio booted.
    pub async fn uptime(&self) -> Result<u64, ClientError> {
        let command = "radio uptime";
        let reply = self.send_command(command).await?;
        reply
            .payload
            .trim()
            .parse()
            .map_err(|_| ClientError::Reply {
                command: command.into(),
                reason: format!("{:?} is not a number of seconds", reply.payload),
            })
    }

    pub async fn antenna_list(&self) -> Result<Vec<String>, ClientError> {
        let reply = self.send_command("ant list").await?;
        Ok(split_list(&reply.payload))
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

fn parse_info(payload: &str) -> HashMap<String, String> {
    let delimiter = if payload.contains(',') { ',' } else { ' ' };
    parse_key_values(payload, delimiter)
        .into_iter()
        .map(|(key, value)| (key, value.trim_matches('"').to_string()))
        .collect()
}

fn split_list(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_accepts_commas_and_quotes() {
        let info = parse_info(r#"model="FLEX-6500",chassis_serial="1234",name="shack",callsign=K1ABC"#);
        assert_eq!(info.get("model").map(String::as_str), Some("FLEX-6500"));
        assert_eq!(info.get("name").map(String::as_str), Some("shack"));
        assert_eq!(info.get("callsign").map(String::as_str), Some("K1ABC"));
    }

    #[test]
    fn info_falls_back_to_spaces() {
        let info = parse_info("model=FLEX-6300 gps=present");
        assert_eq!(info.len(), 2);
        assert_eq!(info.get("gps").map(String::as_str), Some("present"));
    }

    #[test]
    fn lists_drop_empty_items() {
        assert_eq!(split_list("ANT1,ANT2,,XVTR "), vec!["ANT1", "ANT2", "XVTR"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn client_error_display() {
        let err = ClientError::from(CommandError::Timeout);
        assert_eq!(err.to_string(), "command error: no reply within the command timeout");
    }
}
