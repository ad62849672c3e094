use std::fmt;

use thiserror::Error;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal session transition {from} -> {to}")]
pub struct SessionStateError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// Validates a move to `next` and returns it.
    ///
    /// Any state may move to `Closing`. Failures during `Connecting` or
    /// `Authenticating` may drop straight to `Disconnected`.
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let legal = matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Closing, Disconnected)
                | (Connecting, Disconnected)
                | (Authenticating, Disconnected)
                | (_, Closing)
        );
        if legal && self != next {
            Ok(next)
        } else {
            Err(SessionStateError {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_active(self) -> bool {
        self == SessionState::Active
    }

    /// No further commands will be accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}
