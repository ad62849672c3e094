//! Scripted radio for end-to-end tests and demos.
//!
//! Plays the device side of a [`MemoryTransport`](crate::transport::MemoryTransport):
//! answers every command (success with an empty payload unless scripted
//! otherwise), records what it received, and exposes the datagram endpoint
//! the client bound so tests can stream frames at it.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::LineDialect;
use crate::transport::memory::{DatagramInjector, RadioControl};
use crate::transport::MemoryRadio;

/// Canned behaviour for a [`ScriptedRadio`].
#[derive(Debug, Clone, Default)]
pub struct RadioScript {
    dialect: LineDialect,
    greeting: Vec<String>,
    replies: HashMap<String, (u32, String)>,
    silent: HashSet<String>,
}

impl RadioScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialect(mut self, dialect: LineDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Line sent as soon as the client connects.
    pub fn greet(mut self, line: impl Into<String>) -> Self {
        self.greeting.push(line.into());
        self
    }

    /// Answer `command` with `code` and `payload`.
    pub fn reply(mut self, command: impl Into<String>, code: u32, payload: impl Into<String>) -> Self {
        self.replies.insert(command.into(), (code, payload.into()));
        self
    }

    /// Never answer `command`.
    pub fn ignore(mut self, command: impl Into<String>) -> Self {
        self.silent.insert(command.into());
        self
    }
}

/// A command line as the radio received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub line: String,
    pub sequence: u32,
    pub text: String,
    pub diagnostic: bool,
}

enum Action {
    Line(String),
    HangUp,
}

/// Handle to a running scripted radio task.
#[derive(Debug)]
pub struct ScriptedRadio {
    received: mpsc::UnboundedReceiver<ReceivedCommand>,
    actions: mpsc::UnboundedSender<Action>,
    endpoint: watch::Receiver<Option<DatagramInjector>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Line(line) => f.debug_tuple("Line").field(line).finish(),
            Action::HangUp => f.write_str("HangUp"),
        }
    }
}

impl ScriptedRadio {
    /// Starts serving the first control connection made through `radio`.
    pub fn spawn(radio: MemoryRadio, script: RadioScript) -> Self {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (actions, actions_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint) = watch::channel(None);
        let task = tokio::spawn(serve(radio, script, received_tx, actions_rx, endpoint_tx));
        Self {
            received,
            actions,
            endpoint,
            task,
        }
    }

    /// Next command the client sent; `None` once the radio stopped.
    pub async fn next_command(&mut self) -> Option<ReceivedCommand> {
        self.received.recv().await
    }

    /// Skips commands until one with `text` arrives.
    pub async fn wait_for_command(&mut self, text: &str) -> Option<ReceivedCommand> {
        while let Some(command) = self.received.recv().await {
            if command.text == text {
                return Some(command);
            }
        }
        None
    }

    /// Sends an arbitrary line (status, message, stray reply) to the client.
    pub fn push_line(&self, line: impl Into<String>) {
        let _ = self.actions.send(Action::Line(line.into()));
    }

    /// Drops the control connection.
    pub fn hang_up(&self) {
        let _ = self.actions.send(Action::HangUp);
    }

    /// Waits until the client bound its datagram endpoint.
    pub async fn datagram_endpoint(&mut self) -> Option<DatagramInjector> {
        let endpoint = self.endpoint.wait_for(Option::is_some).await.ok()?;
        (*endpoint).clone()
    }

    /// Waits for the radio task to end (client hung up or [`hang_up`](Self::hang_up)).
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

async fn serve(
    mut radio: MemoryRadio,
    script: RadioScript,
    received: mpsc::UnboundedSender<ReceivedCommand>,
    mut actions: mpsc::UnboundedReceiver<Action>,
    endpoint: watch::Sender<Option<DatagramInjector>>,
) {
    let Some(mut control) = radio.accept().await else {
        return;
    };
    for line in &script.greeting {
        if control.send_line(line).await.is_err() {
            return;
        }
    }

    let mut binds_open = true;
    loop {
        tokio::select! {
            line = control.recv_line() => {
                let Some(line) = line else {
                    debug!("scripted radio: client hung up");
                    break;
                };
                let Some(command) = parse_command(&line) else {
                    continue;
                };
                let _ = received.send(command.clone());
                if !answer(&mut control, &script, &command).await {
                    break;
                }
            }
            bound = radio.datagram_endpoint(), if binds_open => match bound {
                Some(injector) => {
                    let _ = endpoint.send(Some(injector));
                }
                None => binds_open = false,
            },
            action = actions.recv() => match action {
                Some(Action::Line(line)) => {
                    if control.send_line(&line).await.is_err() {
                        break;
                    }
                }
                Some(Action::HangUp) | None => break,
            },
        }
    }
}

async fn answer(control: &mut RadioControl, script: &RadioScript, command: &ReceivedCommand) -> bool {
    if script.silent.contains(&command.text) {
        return true;
    }
    let (code, payload) = script
        .replies
        .get(&command.text)
        .cloned()
        .unwrap_or_default();
    let reply = match script.dialect {
        LineDialect::Bare => format!("{}|{:X}|{}", command.sequence, code, payload),
        LineDialect::Tagged => format!("R{}|{:X}|{}", command.sequence, code, payload),
    };
    control.send_line(&reply).await.is_ok()
}

fn parse_command(line: &str) -> Option<ReceivedCommand> {
    let (diagnostic, body) = if let Some(rest) = line.strip_prefix("CD") {
        (true, rest)
    } else if let Some(rest) = line.strip_prefix('C') {
        (false, rest)
    } else {
        (false, line)
    };
    let (sequence, text) = body.split_once('|')?;
    Some(ReceivedCommand {
        line: line.to_string(),
        sequence: sequence.parse().ok()?,
        text: text.to_string(),
        diagnostic,
    })
}
