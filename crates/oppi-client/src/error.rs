//! Error types for the client layers.

use std::time::Duration;

use oppi_protocol::EncodeError;
use thiserror::Error;

/// Failure to hand a message to the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection did not reach `connected` within the send wait window.
    #[error("not connected")]
    NotConnected,

    /// The write could not be queued in time.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// The transport was shut down.
    #[error("connection closed")]
    Closed,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl TransportError {
    /// Whether a fresh attempt of the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::SendTimeout(_))
    }
}

/// Failure of a command sent through the ack engine.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{command} could not be sent after {attempts} attempt(s): {source}")]
    Transport {
        command: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The server explicitly refused the command. Never retried.
    #[error("{command} rejected: {reason}")]
    Rejected { command: String, reason: String },

    /// Neither a result nor a sufficient ack arrived in time. Never retried.
    #[error("{command} not acknowledged within {waited:?}")]
    Timeout { command: String, waited: Duration },

    /// The waiter was dropped before anything resolved it.
    #[error("request dropped before it was resolved")]
    Dropped,

    #[error("no active session")]
    NoActiveSession,
}

impl CommandError {
    /// Number of physical send attempts, when the failure was at the transport.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Transport { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Failure of the fork-from-entry flow.
#[derive(Debug, Error)]
pub enum ForkError {
    #[error("cannot fork while a turn is in progress")]
    TurnInProgress,

    #[error("session has no forkable messages")]
    NoForkableMessages,

    #[error("entry {0} is not forkable")]
    NotForkable(String),

    #[error("invalid fork response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Result alias for command operations.
pub type CommandResult<T> = std::result::Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::NotConnected.is_retryable());
        assert!(TransportError::SendTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!TransportError::Closed.is_retryable());
        assert!(!TransportError::Connect("refused".to_string()).is_retryable());
    }

    #[test]
    fn test_rejection_reason_verbatim() {
        let err = CommandError::Rejected {
            command: "prompt".to_string(),
            reason: "session is stopping".to_string(),
        };
        assert_eq!(err.to_string(), "prompt rejected: session is stopping");
        assert_eq!(err.attempts(), None);
    }
}
