//! Collaborators the client consumes but does not implement.

use anyhow::Result;
use async_trait::async_trait;
use oppi_protocol::{SessionInfo, WorkspaceInfo};

/// Where to reach the server and how to authenticate.
pub trait CredentialsProvider: Send + Sync {
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    fn token(&self) -> Option<&str>;
    fn tls(&self) -> bool;

    /// WebSocket endpoint for the session stream.
    fn stream_url(&self) -> String {
        let scheme = if self.tls() { "wss" } else { "ws" };
        let mut url = format!("{scheme}://{}:{}/stream", self.host(), self.port());
        if let Some(token) = self.token() {
            url.push_str("?token=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }
}

/// Credentials taken verbatim from configuration.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub tls: bool,
}

impl CredentialsProvider for StaticCredentials {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn tls(&self) -> bool {
        self.tls
    }
}

/// List endpoints used for foreground resync.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>>;
    async fn fetch_workspaces(&self) -> Result<Vec<WorkspaceInfo>>;
}

/// Fetches the full body of a tool output whose preview was truncated.
#[async_trait]
pub trait ToolOutputSource: Send + Sync {
    async fn fetch_full_output(&self, session_id: &str, tool_call_id: &str) -> Result<String>;
}
