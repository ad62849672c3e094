//! Line protocol spoken on the TCP control channel.
//!
//! Every command and every message from the radio is one UTF-8 line. The
//! codec layer adds and strips the trailing newline, so everything here works
//! on bare line text.
//!
//! Outbound, a command is `<sequence>|<text>` in the bare dialect or
//! `C<sequence>|<text>` (`CD` for diagnostic commands) in the tagged dialect.
//! Inbound, the first character classifies the line:
//!
//! | line                               | meaning                         |
//! |------------------------------------|---------------------------------|
//! | `[R]<seq>\|<hex code>\|<payload>`  | reply to a pending command      |
//! | `S<category>\|<k=v ...>` (bare)    | unsolicited status              |
//! | `S<handle>\|<category> <k=v ...>`  | unsolicited status (tagged)     |
//! | `H<handle>`                        | client handle assigned to us    |
//! | `V<version>`                       | radio protocol version          |
//! | `M<hex number>\|<text>`            | radio message with a severity   |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which framing the radio expects for commands and status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineDialect {
    /// `<seq>|<text>` commands, `S<category>|<payload>` status.
    #[default]
    Bare,
    /// `C<seq>|<text>` commands, `S<handle>|<category> <payload>` status.
    Tagged,
}

/// Reply to a previously issued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub sequence: u32,
    pub code: u32,
    pub payload: String,
    /// Trailing diagnostic text some radios append as a fourth field.
    pub debug: Option<String>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Unsolicited status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub category: String,
    /// Client handle the status was addressed to (tagged dialect only).
    pub handle: Option<String>,
    pub pairs: Vec<(String, String)>,
    pub raw: String,
}

impl StatusEvent {
    /// First value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Severity carried in bits 24-25 of a radio message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl MessageSeverity {
    fn from_number(number: u32) -> Self {
        match (number & 0x0300_0000) >> 24 {
            0 => MessageSeverity::Info,
            1 => MessageSeverity::Warning,
            2 => MessageSeverity::Error,
            _ => MessageSeverity::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioMessage {
    pub number: u32,
    pub severity: MessageSeverity,
    pub text: String,
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Reply(Reply),
    Status(StatusEvent),
    Handle(String),
    Version(String),
    Message(RadioMessage),
}

/// Inbound line that does not fit any known shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("empty line")]
    Empty,
    #[error("unknown line prefix {0:?}")]
    UnknownPrefix(char),
    #[error("{kind} line is missing its {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("invalid sequence number {0:?}")]
    BadSequence(String),
    #[error("invalid status code {0:?}")]
    BadCode(String),
    /// The transport skipped a line it could not decode.
    #[error("undecodable line: {0}")]
    Undecodable(String),
}

/// Builds the wire text of a command, without the line terminator.
pub fn encode_command(dialect: LineDialect, sequence: u32, text: &str, diagnostic: bool) -> String {
    match dialect {
        LineDialect::Bare => format!("{sequence}|{text}"),
        LineDialect::Tagged if diagnostic => format!("CD{sequence}|{text}"),
        LineDialect::Tagged => format!("C{sequence}|{text}"),
    }
}

/// Classifies one inbound line.
pub fn parse_line(line: &str, dialect: LineDialect) -> Result<Inbound, ProtocolViolation> {
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
    let mut chars = line.chars();
    let first = chars.next().ok_or(ProtocolViolation::Empty)?;
    let rest = chars.as_str();
    match first {
        '0'..='9' => parse_reply(line).map(Inbound::Reply),
        'R' | 'r' => parse_reply(rest).map(Inbound::Reply),
        'S' | 's' => parse_status(rest, dialect).map(Inbound::Status),
        'H' | 'h' => non_empty(rest, "handle", "handle").map(Inbound::Handle),
        'V' | 'v' => non_empty(rest, "version", "version").map(Inbound::Version),
        'M' | 'm' => parse_message(rest).map(Inbound::Message),
        other => Err(ProtocolViolation::UnknownPrefix(other)),
    }
}

/// Splits `key=value` tokens; tokens without `=` get an empty value.
pub fn parse_key_values(text: &str, delimiter: char) -> Vec<(String, String)> {
    text.split(delimiter)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (token.to_string(), String::new()),
        })
        .collect()
}

fn non_empty(text: &str, kind: &'static str, field: &'static str) -> Result<String, ProtocolViolation> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ProtocolViolation::MissingField { kind, field });
    }
    Ok(text.to_string())
}

fn parse_reply(body: &str) -> Result<Reply, ProtocolViolation> {
    let mut fields = body.splitn(4, '|');
    let seq_text = fields.next().unwrap_or_default();
    let sequence = seq_text
        .trim()
        .parse::<u32>()
        .map_err(|_| ProtocolViolation::BadSequence(seq_text.to_string()))?;
    let code_text = fields.next().ok_or(ProtocolViolation::MissingField {
        kind: "reply",
        field: "status code",
    })?;
    let code = u32::from_str_radix(code_text.trim(), 16)
        .map_err(|_| ProtocolViolation::BadCode(code_text.to_string()))?;
    let payload = fields.next().unwrap_or_default().to_string();
    let debug = fields.next().map(str::to_string);
    Ok(Reply {
        sequence,
        code,
        payload,
        debug,
    })
}

fn parse_status(body: &str, dialect: LineDialect) -> Result<StatusEvent, ProtocolViolation> {
    let (head, payload) = body.split_once('|').ok_or(ProtocolViolation::MissingField {
        kind: "status",
        field: "separator",
    })?;
    let (category, handle, kv_text) = match dialect {
        LineDialect::Bare => (head.trim().to_string(), None, payload),
        LineDialect::Tagged => {
            let payload = payload.trim_start();
            let (category, remainder) = payload.split_once(' ').unwrap_or((payload, ""));
            (
                category.trim().to_string(),
                Some(head.trim().to_string()).filter(|h| !h.is_empty()),
                remainder,
            )
        }
    };
    if category.is_empty() {
        return Err(ProtocolViolation::MissingField {
            kind: "status",
            field: "category",
        });
    }
    Ok(StatusEvent {
        category,
        handle,
        pairs: parse_key_values(kv_text, ' '),
        raw: payload.to_string(),
    })
}

fn parse_message(body: &str) -> Result<RadioMessage, ProtocolViolation> {
    let (number_text, text) = body.split_once('|').ok_or(ProtocolViolation::MissingField {
        kind: "message",
        field: "separator",
    })?;
    let number = u32::from_str_radix(number_text.trim(), 16)
        .map_err(|_| ProtocolViolation::BadCode(number_text.to_string()))?;
    Ok(RadioMessage {
        number,
        severity: MessageSeverity::from_number(number),
        text: text.to_string(),
    })
}
