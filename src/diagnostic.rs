use std::fmt;

use crate::protocol::{ProtocolViolation, RadioMessage};
use crate::registry::SubscriptionHandle;
use crate::stream::ConsumerHandle;
use crate::transport::TransportError;

/// Out-of-band report from a session or its stream lane.
///
/// Delivered on the channel returned by `Session::take_diagnostics`. None of
/// these affect the command that happens to be in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    ListenerFailed {
        subscription: SubscriptionHandle,
        category: String,
        error: String,
    },
    ConsumerFailed {
        consumer: ConsumerHandle,
        stream_id: u16,
        error: String,
    },
    ProtocolViolation {
        line: String,
        violation: ProtocolViolation,
    },
    RadioMessage(RadioMessage),
    /// Streaming data started (`true`) or went quiet (`false`).
    StreamActivity { active: bool },
    /// The session ended. Sent exactly once.
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    ClosedByHost,
    PeerClosed,
    Transport(TransportError),
    KeepaliveLost,
    ProtocolViolations(u32),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::ClosedByHost => f.write_str("closed by host"),
            TerminationReason::PeerClosed => f.write_str("radio closed the connection"),
            TerminationReason::Transport(err) => write!(f, "transport failure: {err}"),
            TerminationReason::KeepaliveLost => f.write_str("keepalive lost"),
            TerminationReason::ProtocolViolations(n) => {
                write!(f, "{n} protocol violations")
            }
        }
    }
}
