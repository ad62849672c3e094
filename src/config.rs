use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::LineDialect;

/// Default UDP port the radio streams to.
pub const DEFAULT_UDP_PORT: u16 = 4991;

/// Error produced when session configuration fails validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("keepalive timeout must exceed the keepalive interval")]
    KeepaliveWindow,
    #[error("udp bind attempts must be at least one")]
    NoBindAttempts,
    #[error("handshake command {0:?} contains a line break")]
    MultilineCommand(String),
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for one radio session.
///
/// Durations are carried as milliseconds so the structure maps one-to-one onto
/// a JSON document; the accessor methods hand out [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub dialect: LineDialect,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Sends `client program <name>` before the handshake commands.
    pub announce_client: bool,
    /// Commands that must all succeed before the session becomes active.
    pub handshake_commands: Vec<String>,
    pub udp_port: u16,
    pub udp_bind_attempts: u16,
    /// Sends `client udpport <port>` once the datagram socket is bound.
    pub announce_udp_port: bool,
    pub keepalive: bool,
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub max_protocol_violations: u32,
    pub stream_grace_ms: u64,
    pub stream_grace_capacity: usize,
    pub stream_inactivity_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dialect: LineDialect::Bare,
            connect_timeout_ms: 500,
            command_timeout_ms: 5_000,
            announce_client: true,
            handshake_commands: vec![
                "info".into(),
                "version".into(),
                "sub radio all".into(),
                "sub slice all".into(),
                "sub meter all".into(),
            ],
            udp_port: DEFAULT_UDP_PORT,
            udp_bind_attempts: 20,
            announce_udp_port: true,
            keepalive: true,
            keepalive_interval_ms: 1_000,
            keepalive_timeout_ms: 4_000,
            max_protocol_violations: 8,
            stream_grace_ms: 2_000,
            stream_grace_capacity: 64,
            stream_inactivity_ms: 1_000,
        }
    }
}

impl SessionConfig {
    /// Parses a JSON document; missing fields fall back to defaults.
    pub fn from_json_str(doc: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal setup for tests and scripted peers: no handshake script,
    /// no announcements, no keepalive.
    pub fn bare() -> Self {
        Self {
            announce_client: false,
            handshake_commands: Vec::new(),
            announce_udp_port: false,
            keepalive: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("connect timeout", self.connect_timeout_ms),
            ("command timeout", self.command_timeout_ms),
            ("stream grace", self.stream_grace_ms),
            ("stream inactivity", self.stream_inactivity_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.keepalive {
            if self.keepalive_interval_ms == 0 {
                return Err(ConfigError::ZeroDuration("keepalive interval"));
            }
            if self.keepalive_timeout_ms <= self.keepalive_interval_ms {
                return Err(ConfigError::KeepaliveWindow);
            }
        }
        if self.udp_bind_attempts == 0 {
            return Err(ConfigError::NoBindAttempts);
        }
        if let Some(cmd) = self
            .handshake_commands
            .iter()
            .find(|cmd| cmd.contains(|c: char| c == '\r' || c == '\n'))
        {
            return Err(ConfigError::MultilineCommand(cmd.clone()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn stream_grace(&self) -> Duration {
        Duration::from_millis(self.stream_grace_ms)
    }

    pub fn stream_inactivity(&self) -> Duration {
        Duration::from_millis(self.stream_inactivity_ms)
    }

    /// How often the session task sweeps for expired commands and keepalive
    /// deadlines.
    pub fn sweep_interval(&self) -> Duration {
        let mut base = self.command_timeout() / 4;
        if self.keepalive {
            base = base.min(self.keepalive_interval() / 2);
        }
        base.clamp(Duration::from_millis(10), Duration::from_millis(250))
    }

    /// Ports tried, in order, when binding the datagram socket.
    pub fn udp_candidate_ports(&self) -> Vec<u16> {
        if self.udp_port == 0 {
            return vec![0];
        }
        (0..self.udp_bind_attempts)
            .filter_map(|offset| self.udp_port.checked_add(offset))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::bare().validate().is_ok());
    }

    #[test]
    fn keepalive_window_is_checked() {
        let config = SessionConfig {
            keepalive_interval_ms: 2_000,
            keepalive_timeout_ms: 2_000,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::KeepaliveWindow)));
    }

    #[test]
    fn multiline_handshake_command_rejected() {
        let config = SessionConfig {
            handshake_commands: vec!["info\nversion".into()],
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MultilineCommand(_))
        ));
    }

    #[test]
    fn json_overrides_merge_with_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{ "dialect": "tagged", "command_timeout_ms": 750, "udp_port": 5000 }"#,
        )
        .unwrap();
        assert_eq!(config.dialect, LineDialect::Tagged);
        assert_eq!(config.command_timeout(), Duration::from_millis(750));
        assert_eq!(config.udp_port, 5000);
        assert!(config.keepalive);
    }

    #[test]
    fn json_rejects_zero_timeout() {
        let err = SessionConfig::from_json_str(r#"{ "command_timeout_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration("command timeout")));
    }

    #[test]
    fn candidate_ports_scan_upward() {
        let config = SessionConfig {
            udp_port: 4991,
            udp_bind_attempts: 3,
            ..SessionConfig::default()
        };
        assert_eq!(config.udp_candidate_ports(), vec![4991, 4992, 4993]);

        let ephemeral = SessionConfig {
            udp_port: 0,
            ..SessionConfig::default()
        };
        assert_eq!(ephemeral.udp_candidate_ports(), vec![0]);
    }

    #[test]
    fn sweep_interval_is_clamped() {
        let config = SessionConfig {
            command_timeout_ms: 20,
            keepalive: false,
            ..SessionConfig::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_millis(10));
        assert_eq!(
            SessionConfig::default().sweep_interval(),
            Duration::from_millis(250)
        );
    }
}
