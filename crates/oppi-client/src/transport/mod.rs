//! Connection to the agent server.
//!
//! The [`Transport`] trait is the seam between the command engine and the
//! socket. [`WsTransport`] is the production implementation; tests script
//! their own.

pub mod backoff;
pub mod ws;

use std::time::Duration;

use async_trait::async_trait;
use oppi_protocol::ClientMessage;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::TransportError;

pub use ws::{WsSettings, WsTransport};

/// Connection state as observed by the rest of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before attempt `attempt`.
    Reconnecting { attempt: u32 },
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// A connection attempt is under way and may still succeed.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting. Returns once the attempt is under way; watch
    /// [`Transport::status`] for the outcome. No-op when already running.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Queue one message for the server.
    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError>;

    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    async fn disconnect(&self);
}

/// Bounds on how long a send may wait.
#[derive(Debug, Clone)]
pub struct SendPolicy {
    /// How long to wait for a pending connection to come up.
    pub wait_timeout: Duration,
    /// How often to re-check the status while waiting.
    pub poll_interval: Duration,
    /// How long a single write may take to queue.
    pub send_timeout: Duration,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Wait a bounded time for the connection to be usable.
///
/// Fails immediately when plainly disconnected, and with `NotConnected` when
/// a pending connection does not come up within `policy.wait_timeout`.
pub async fn wait_until_connected(
    status: &watch::Receiver<ConnectionStatus>,
    policy: &SendPolicy,
) -> Result<(), TransportError> {
    let deadline = Instant::now() + policy.wait_timeout;
    loop {
        let current = *status.borrow();
        match current {
            ConnectionStatus::Connected => return Ok(()),
            ConnectionStatus::Disconnected => return Err(TransportError::NotConnected),
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting { .. } => {
                if Instant::now() >= deadline {
                    return Err(TransportError::NotConnected);
                }
                tokio::time::sleep(policy.poll_interval).await;
            }
        }
    }
}
