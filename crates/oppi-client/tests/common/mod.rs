//! Shared test fixtures: a scripted in-memory transport and mock collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use oppi_client::command::CommandSettings;
use oppi_client::sources::{SyncSource, ToolOutputSource};
use oppi_client::{
    CommandEngine, Connection, ConnectionStatus, RouterSettings, TimelineLimits, Transport,
    TransportError, spawn_inbound_pump,
};
use oppi_protocol::{AckStage, ClientMessage, ServerMessage, SessionInfo, WorkspaceInfo};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What the transport does with the next send.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Accept and auto-reply.
    Accept,
    /// Accept and never reply.
    Silent,
    /// Accept and answer with a failed command result.
    Reject(String),
    NotConnected,
    SendTimeout,
}

pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<ClientMessage>>,
    responses: Mutex<HashMap<String, Value>>,
    status: watch::Sender<ConnectionStatus>,
    inbound: mpsc::Sender<ServerMessage>,
    connects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (inbound, rx) = mpsc::channel(1024);
        let (status, _) = watch::channel(ConnectionStatus::Connected);
        let transport = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            status,
            inbound,
            connects: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    /// Queue outcomes for the next sends. Unscripted sends are accepted.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Scripted>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// `data` returned in the successful result for `command`.
    pub fn respond_with(&self, command: &str, data: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), data);
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    /// Every send attempt, including failed ones.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_named(&self, command: &str) -> Vec<ClientMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.command_name() == command)
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn push(&self, message: ServerMessage) {
        let _ = self.inbound.try_send(message);
    }

    fn reply(&self, message: &ClientMessage) {
        match message.turn_id() {
            Some(turn_id) => self.push(ServerMessage::TurnAck {
                session_id: message.session_id().map(str::to_string),
                turn_id: turn_id.to_string(),
                request_id: Some(message.request_id().to_string()),
                stage: AckStage::Dispatched,
            }),
            None => {
                let data = self
                    .responses
                    .lock()
                    .unwrap()
                    .get(message.command_name())
                    .cloned();
                self.push(ServerMessage::CommandResult {
                    command: message.command_name().to_string(),
                    request_id: Some(message.request_id().to_string()),
                    success: true,
                    data,
                    error: None,
                    session_id: message.session_id().map(str::to_string),
                });
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.status.send_replace(ConnectionStatus::Connected);
        Ok(())
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(message.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Scripted::Accept);
        match next {
            Scripted::Accept => {
                self.reply(message);
                Ok(())
            }
            Scripted::Silent => Ok(()),
            Scripted::Reject(reason) => {
                self.push(ServerMessage::CommandResult {
                    command: message.command_name().to_string(),
                    request_id: Some(message.request_id().to_string()),
                    success: false,
                    data: None,
                    error: Some(reason),
                    session_id: message.session_id().map(str::to_string),
                });
                Ok(())
            }
            Scripted::NotConnected => Err(TransportError::NotConnected),
            Scripted::SendTimeout => Err(TransportError::SendTimeout(Duration::from_millis(10))),
        }
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    async fn disconnect(&self) {
        self.status.send_replace(ConnectionStatus::Disconnected);
    }
}

/// A router wired to a [`MockTransport`] through the real inbound pump.
pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub connection: Connection,
    pub router_rx: mpsc::UnboundedReceiver<ServerMessage>,
    pump: JoinHandle<()>,
}

pub fn fast_command_settings() -> CommandSettings {
    CommandSettings {
        ack_timeout: Duration::from_millis(500),
        max_send_attempts: 2,
    }
}

pub fn harness() -> Harness {
    harness_with(RouterSettings {
        unsubscribe_grace: Duration::from_millis(100),
        freshness_threshold: Duration::from_secs(60),
    })
}

pub fn harness_with(settings: RouterSettings) -> Harness {
    let (transport, inbound) = MockTransport::new();
    let engine = CommandEngine::new(transport.clone(), fast_command_settings());
    let (pump, router_rx) = spawn_inbound_pump(engine.clone(), inbound);
    let connection = Connection::new(engine, settings, TimelineLimits::default());
    Harness {
        transport,
        connection,
        router_rx,
        pump,
    }
}

impl Harness {
    /// Route everything the pump has forwarded so far.
    pub async fn drain(&mut self) {
        while let Ok(message) = self.router_rx.try_recv() {
            self.connection.handle(message).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// -- Collaborators --

#[derive(Default)]
pub struct MockSyncSource {
    pub sessions: Vec<SessionInfo>,
    pub session_calls: AtomicUsize,
    pub workspace_calls: AtomicUsize,
}

#[async_trait]
impl SyncSource for MockSyncSource {
    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sessions.clone())
    }

    async fn fetch_workspaces(&self) -> Result<Vec<WorkspaceInfo>> {
        self.workspace_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Returns `"full:<tool_call_id>"` after `delay`.
pub struct SlowOutputSource {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowOutputSource {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ToolOutputSource for SlowOutputSource {
    async fn fetch_full_output(&self, _session_id: &str, tool_call_id: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if tool_call_id.is_empty() {
            return Err(anyhow!("empty tool call id"));
        }
        Ok(format!("full:{tool_call_id}"))
    }
}

// -- Message builders --

pub fn agent_start(session: &str) -> ServerMessage {
    ServerMessage::AgentStart {
        session_id: session.to_string(),
    }
}

pub fn agent_end(session: &str) -> ServerMessage {
    ServerMessage::AgentEnd {
        session_id: session.to_string(),
    }
}

pub fn text_delta(session: &str, delta: &str) -> ServerMessage {
    ServerMessage::TextDelta {
        session_id: session.to_string(),
        delta: delta.to_string(),
    }
}

pub fn tool_start(session: &str, id: &str, tool: &str) -> ServerMessage {
    ServerMessage::ToolStart {
        session_id: session.to_string(),
        tool_call_id: id.to_string(),
        tool: tool.to_string(),
        args: serde_json::json!({"command": "ls"}),
        details: None,
    }
}

pub fn permission_request(session: &str, id: &str) -> ServerMessage {
    ServerMessage::PermissionRequest {
        session_id: session.to_string(),
        id: id.to_string(),
        tool: "bash".to_string(),
        input: serde_json::json!({"command": "rm -rf build"}),
        display_summary: "rm -rf build".to_string(),
        expires_at: None,
    }
}
