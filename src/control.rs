use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{encode_command, LineDialect, Reply};

/// Terminal failure of a single command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The radio answered with a non-zero status code.
    #[error("command rejected with code {code:#x}: {payload}")]
    Rejected { code: u32, payload: String },
    #[error("no reply within the command timeout")]
    Timeout,
    #[error("session closed before a reply arrived")]
    SessionClosed,
    #[error("command could not be written: {0}")]
    Send(String),
    #[error("invalid command text: {0}")]
    Invalid(String),
}

pub type CommandResult = Result<Reply, CommandError>;

/// Callback run with a command's outcome.
pub type CommandCallback = Box<dyn FnOnce(CommandResult) + Send + 'static>;

/// Where a command's outcome goes once it settles.
pub enum Completion {
    Channel(oneshot::Sender<CommandResult>),
    Callback(CommandCallback),
    /// Outcome consumed by the session itself (keepalive pings).
    Internal,
}

impl Completion {
    /// Hands `outcome` to the waiting party. Consumes the completion so an
    /// outcome can be delivered only once.
    pub fn deliver(self, outcome: CommandResult) {
        match self {
            Completion::Channel(tx) => {
                // Receiver dropped means the caller stopped waiting.
                let _ = tx.send(outcome);
            }
            Completion::Callback(callback) => callback(outcome),
            Completion::Internal => {}
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Completion::Internal)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Completion::Channel(_) => "Channel",
            Completion::Callback(_) => "Callback",
            Completion::Internal => "Internal",
        };
        f.write_str(kind)
    }
}

#[derive(Debug)]
struct PendingCommand {
    text: String,
    issued_at: Instant,
    completion: Completion,
}

/// A command that reached its terminal outcome and left the pending table.
#[derive(Debug)]
pub struct Settled {
    pub sequence: u32,
    pub text: String,
    pub completion: Completion,
    pub outcome: CommandResult,
}

impl Settled {
    pub fn deliver(self) {
        self.completion.deliver(self.outcome);
    }
}

/// Sequence allocation and reply correlation for the control channel.
///
/// # Guarantees
/// * Sequence numbers start at 1, strictly increase and are never reused
///   within one engine.
/// * A pending command leaves the table exactly once: on its reply, on
///   timeout, or when the engine is drained.
#[derive(Debug)]
pub struct CommandEngine {
    dialect: LineDialect,
    timeout: Duration,
    next_sequence: u32,
    pending: BTreeMap<u32, PendingCommand>,
}

impl CommandEngine {
    pub fn new(dialect: LineDialect, timeout: Duration) -> Self {
        Self {
            dialect,
            timeout,
            next_sequence: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Registers a command and returns its sequence number and wire line.
    ///
    /// # Errors
    /// Text containing a line break is refused before a sequence number is
    /// consumed; the completion is handed back with the error.
    pub fn issue(
        &mut self,
        text: &str,
        diagnostic: bool,
        completion: Completion,
        now: Instant,
    ) -> Result<(u32, String), (CommandError, Completion)> {
        if text.contains(|c: char| c == '\r' || c == '\n') {
            return Err((
                CommandError::Invalid("command text contains a line break".into()),
                completion,
            ));
        }
        if text.trim().is_empty() {
            return Err((CommandError::Invalid("empty command".into()), completion));
        }
        let sequence = self.next_sequence;
        let Some(following) = sequence.checked_add(1) else {
            return Err((
                CommandError::Invalid("sequence numbers exhausted".into()),
                completion,
            ));
        };
        self.next_sequence = following;
        let line = encode_command(self.dialect, sequence, text, diagnostic);
        self.pending.insert(
            sequence,
            PendingCommand {
                text: text.to_string(),
                issued_at: now,
                completion,
            },
        );
        debug!(sequence, command = text, "command issued");
        Ok((sequence, line))
    }

    /// Matches a reply against the pending table.
    ///
    /// Returns `None` for a sequence nothing is waiting for (already timed out
    /// or never issued by this engine).
    pub fn resolve(&mut self, reply: Reply) -> Option<Settled> {
        let sequence = reply.sequence;
        let Some(pending) = self.pending.remove(&sequence) else {
            if reply.is_success() {
                debug!(sequence, "reply for unknown sequence");
            } else {
                warn!(
                    sequence,
                    code = reply.code,
                    payload = %reply.payload,
                    "unmatched non-zero reply"
                );
            }
            return None;
        };
        let outcome = if reply.is_success() {
            Ok(reply)
        } else {
            Err(CommandError::Rejected {
                code: reply.code,
                payload: reply.payload,
            })
        };
        Some(Settled {
            sequence,
            text: pending.text,
            completion: pending.completion,
            outcome,
        })
    }

    /// Removes one pending command and fails it with `error`.
    pub fn fail(&mut self, sequence: u32, error: CommandError) -> Option<Settled> {
        self.pending.remove(&sequence).map(|pending| Settled {
            sequence,
            text: pending.text,
            completion: pending.completion,
            outcome: Err(error),
        })
    }

    /// Fails every command issued more than the timeout before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Settled> {
        let timeout = self.timeout;
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, cmd)| now.saturating_duration_since(cmd.issued_at) >= timeout)
            .map(|(seq, _)| *seq)
            .collect();
        expired
            .into_iter()
            .filter_map(|seq| {
                warn!(sequence = seq, "command timed out");
                self.fail(seq, CommandError::Timeout)
            })
            .collect()
    }

    /// Empties the table, failing everything with `SessionClosed`.
    pub fn drain(&mut self) -> Vec<Settled> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(sequence, pending)| Settled {
                sequence,
                text: pending.text,
                completion: pending.completion,
                outcome: Err(CommandError::SessionClosed),
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sequence number the next issued command will use.
    pub fn peek_sequence(&self) -> u32 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CommandEngine {
        CommandEngine::new(LineDialect::Bare, Duration::from_millis(100))
    }

    fn reply(sequence: u32, code: u32, payload: &str) -> Reply {
        Reply {
            sequence,
            code,
            payload: payload.into(),
            debug: None,
        }
    }

    fn channel() -> (Completion, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Channel(tx), rx)
    }

    #[test]
    fn first_command_uses_sequence_one() {
        let mut engine = engine();
        let (completion, _rx) = channel();
        let (seq, line) = engine
            .issue("FA 14250000", false, completion, Instant::now())
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(line, "1|FA 14250000");
    }

    #[test]
    fn exhausted_sequences_refuse_the_command() {
        let mut engine = engine();
        engine.next_sequence = u32::MAX;
        let (completion, mut rx) = channel();
        let (err, completion) = engine
            .issue("info", false, completion, Instant::now())
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::Invalid("sequence numbers exhausted".into())
        );
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.peek_sequence(), u32::MAX);
        completion.deliver(Err(err));
        assert!(matches!(rx.try_recv(), Ok(Err(CommandError::Invalid(_)))));
    }

    #[test]
    fn sequences_strictly_increase() {
        let mut engine = engine();
        let now = Instant::now();
        let mut last = 0;
        for _ in 0..50 {
            let (seq, _) = engine.issue("ping", false, Completion::Internal, now).unwrap();
            assert!(seq > last);
            last = seq;
            engine.resolve(reply(seq, 0, ""));
        }
        assert_eq!(engine.peek_sequence(), 51);
    }

    #[test]
    fn zero_code_resolves_success() {
        let mut engine = engine();
        let (completion, mut rx) = channel();
        engine
            .issue("FA 14250000", false, completion, Instant::now())
            .unwrap();
        let settled = engine.resolve(reply(1, 0, "")).unwrap();
        assert_eq!(settled.text, "FA 14250000");
        settled.deliver();
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.payload, "");
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn non_zero_code_is_rejected() {
        let mut engine = engine();
        let (completion, mut rx) = channel();
        engine.issue("FA 1", false, completion, Instant::now()).unwrap();
        engine.resolve(reply(1, 1, "Invalid frequency")).unwrap().deliver();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CommandError::Rejected {
                code: 1,
                payload: "Invalid frequency".into()
            })
        );
    }

    #[test]
    fn out_of_order_replies_match_by_sequence() {
        let mut engine = engine();
        let now = Instant::now();
        let (c1, mut r1) = channel();
        let (c2, mut r2) = channel();
        engine.issue("info", false, c1, now).unwrap();
        engine.issue("version", false, c2, now).unwrap();
        engine.resolve(reply(2, 0, "v")).unwrap().deliver();
        engine.resolve(reply(1, 0, "i")).unwrap().deliver();
        assert_eq!(r1.try_recv().unwrap().unwrap().payload, "i");
        assert_eq!(r2.try_recv().unwrap().unwrap().payload, "v");
    }

    #[test]
    fn unknown_and_duplicate_replies_are_ignored() {
        let mut engine = engine();
        let (completion, _rx) = channel();
        engine.issue("info", false, completion, Instant::now()).unwrap();
        assert!(engine.resolve(reply(9, 0, "")).is_none());
        assert!(engine.resolve(reply(1, 0, "")).is_some());
        assert!(engine.resolve(reply(1, 0, "")).is_none());
    }

    #[test]
    fn expired_commands_time_out_once() {
        let mut engine = engine();
        let start = Instant::now();
        let (c1, mut r1) = channel();
        let (c2, mut r2) = channel();
        engine.issue("slow", false, c1, start).unwrap();
        engine
            .issue("fresh", false, c2, start + Duration::from_millis(80))
            .unwrap();

        let expired = engine.expire(start + Duration::from_millis(120));
        assert_eq!(expired.len(), 1);
        expired.into_iter().for_each(Settled::deliver);
        assert_eq!(r1.try_recv().unwrap(), Err(CommandError::Timeout));
        assert!(r2.try_recv().is_err());

        // A late reply for the timed-out command changes nothing.
        assert!(engine.resolve(reply(1, 0, "")).is_none());
        assert!(engine.expire(start + Duration::from_millis(120)).is_empty());
    }

    #[test]
    fn drain_fails_everything_with_session_closed() {
        let mut engine = engine();
        let now = Instant::now();
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let (completion, rx) = channel();
                engine.issue("info", false, completion, now).unwrap();
                rx
            })
            .collect();
        engine.drain().into_iter().for_each(Settled::deliver);
        for mut rx in receivers {
            assert_eq!(rx.try_recv().unwrap(), Err(CommandError::SessionClosed));
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn callback_completion_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut engine = engine();
        engine
            .issue(
                "info",
                false,
                Completion::Callback(Box::new(move |outcome| {
                    assert!(outcome.is_ok());
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
                Instant::now(),
            )
            .unwrap();
        engine.resolve(reply(1, 0, "")).unwrap().deliver();
        engine.drain().into_iter().for_each(Settled::deliver);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn line_breaks_are_refused_without_consuming_a_sequence() {
        let mut engine = engine();
        let (completion, _rx) = channel();
        let err = engine
            .issue("info\nversion", false, completion, Instant::now())
            .unwrap_err();
        assert!(matches!(err.0, CommandError::Invalid(_)));
        assert_eq!(engine.peek_sequence(), 1);
    }

    #[test]
    fn tagged_dialect_prefixes_commands() {
        let mut engine = CommandEngine::new(LineDialect::Tagged, Duration::from_secs(1));
        let (_, line) = engine
            .issue("slice list", true, Completion::Internal, Instant::now())
            .unwrap();
        assert_eq!(line, "CD1|slice list");
    }
}
