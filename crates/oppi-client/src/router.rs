//! Session router.
//!
//! One [`Connection`] owns all client state for a multiplexed socket: the
//! active session, the timeline for that session, and the global stores.
//! Inbound messages reach it through an [`spawn_inbound_pump`] task that
//! resolves command waiters eagerly, so a handler awaiting a command never
//! blocks its own acknowledgement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use oppi_protocol::{
    ClientMessage, ImageAttachment, PermissionAction, ServerMessage, SessionStatus,
    SubscriptionLevel, TraceEvent, WorkspaceInfo,
};
use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::command::{CommandEngine, ProgressFn};
use crate::error::{CommandError, CommandResult, ForkError, TransportError};
use crate::sources::{SyncSource, ToolOutputSource};
use crate::stores::{
    ExtensionDialog, ExtensionDialogStore, PendingPermission, PermissionStore, SessionStore,
    SyncCache, SyncResource,
};
use crate::timeline::{
    MemoryPressureReport, PermissionOutcome, ReconcilePlan, TimelineItem, TimelineLimits,
    TimelineReducer, compaction_message,
};
use crate::transport::ConnectionStatus;

/// Synthetic suffix the timeline adds to assistant block ids.
static SYNTHETIC_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-(?:text|thinking)-\d+$").expect("Invalid regex pattern for synthetic suffix")
});

/// Where an inbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Not tied to a session (handshake, unscoped errors, unknown types).
    Connection,
    /// `turn_ack` / `command_result`, consumed by the command engine.
    Ack,
    /// Permission and extension UI traffic, kept for every session.
    Global,
    /// Belongs to the active session.
    Active,
    /// Belongs to another session. Dropped.
    Stale,
}

/// Classify a message against the active session.
pub fn route(message: &ServerMessage, active: Option<&str>) -> RouteClass {
    match message {
        ServerMessage::TurnAck { .. } | ServerMessage::CommandResult { .. } => RouteClass::Ack,
        ServerMessage::PermissionRequest { .. }
        | ServerMessage::PermissionExpired { .. }
        | ServerMessage::PermissionCancelled { .. }
        | ServerMessage::ExtensionUiRequest { .. }
        | ServerMessage::ExtensionUiNotification { .. } => RouteClass::Global,
        ServerMessage::Connected { .. } | ServerMessage::Unknown { .. } => RouteClass::Connection,
        other => match other.session_id() {
            None => RouteClass::Connection,
            Some(id) if Some(id) == active => RouteClass::Active,
            Some(_) => RouteClass::Stale,
        },
    }
}

/// Strip a synthetic `-text-<n>` / `-thinking-<n>` suffix.
pub fn normalize_entry_id(id: &str) -> String {
    SYNTHETIC_SUFFIX.replace(id, "").into_owned()
}

/// Spawn the task that observes acknowledgements as soon as they arrive and
/// forwards every message to the router.
pub fn spawn_inbound_pump(
    engine: CommandEngine,
    mut inbound: mpsc::Receiver<ServerMessage>,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<ServerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            engine.observe(&message).await;
            if tx.send(message).is_err() {
                debug!("router channel closed, stopping inbound pump");
                break;
            }
        }
    });
    (handle, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Prompt,
    Steer,
    FollowUp,
}

impl TurnKind {
    fn build(
        self,
        session_id: &str,
        text: &str,
        images: &[ImageAttachment],
        request_id: &str,
        turn_id: &str,
    ) -> ClientMessage {
        let session_id = session_id.to_string();
        let message = text.to_string();
        let request_id = request_id.to_string();
        let turn_id = turn_id.to_string();
        match self {
            Self::Prompt => ClientMessage::Prompt {
                session_id,
                message,
                images: images.to_vec(),
                request_id,
                turn_id,
            },
            Self::Steer => ClientMessage::Steer {
                session_id,
                message,
                request_id,
                turn_id,
            },
            Self::FollowUp => ClientMessage::FollowUp {
                session_id,
                message,
                request_id,
                turn_id,
            },
        }
    }
}

/// Answer to an extension dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogAnswer {
    Value(String),
    Confirmed(bool),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Delay before unsubscribing from a session the user left.
    pub unsubscribe_grace: Duration,
    /// Foreground resync is skipped while the last sync is younger than this.
    pub freshness_threshold: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            unsubscribe_grace: Duration::from_secs(30),
            freshness_threshold: Duration::from_secs(60),
        }
    }
}

struct FetchOutcome {
    item_id: String,
    session_id: String,
    token: CancellationToken,
    result: anyhow::Result<String>,
}

pub struct Connection {
    engine: CommandEngine,
    status: watch::Receiver<ConnectionStatus>,
    settings: RouterSettings,

    active: Option<String>,
    sessions: SessionStore,
    workspaces: Vec<WorkspaceInfo>,
    timeline: TimelineReducer,
    permissions: PermissionStore,
    dialogs: ExtensionDialogStore,
    sync_cache: SyncCache,

    /// Deferred unsubscribe per session.
    cleanups: HashMap<String, CancellationToken>,
    /// Full-output fetches per timeline item.
    fetches: HashMap<String, CancellationToken>,
    fetch_tx: mpsc::UnboundedSender<FetchOutcome>,
    fetch_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    observers: HashMap<String, Vec<mpsc::UnboundedSender<ServerMessage>>>,

    sync_source: Option<Arc<dyn SyncSource>>,
    output_source: Option<Arc<dyn ToolOutputSource>>,
}

impl Connection {
    pub fn new(engine: CommandEngine, settings: RouterSettings, limits: TimelineLimits) -> Self {
        let status = engine.transport().status();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            status,
            settings,
            active: None,
            sessions: SessionStore::new(),
            workspaces: Vec::new(),
            timeline: TimelineReducer::new(limits),
            permissions: PermissionStore::new(),
            dialogs: ExtensionDialogStore::new(),
            sync_cache: SyncCache::new(),
            cleanups: HashMap::new(),
            fetches: HashMap::new(),
            fetch_tx,
            fetch_rx,
            observers: HashMap::new(),
            sync_source: None,
            output_source: None,
        }
    }

    pub fn with_sync_source(mut self, source: Arc<dyn SyncSource>) -> Self {
        self.sync_source = Some(source);
        self
    }

    pub fn with_output_source(mut self, source: Arc<dyn ToolOutputSource>) -> Self {
        self.output_source = Some(source);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn engine(&self) -> &CommandEngine {
        &self.engine
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn timeline(&self) -> &TimelineReducer {
        &self.timeline
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn workspaces(&self) -> &[WorkspaceInfo] {
        &self.workspaces
    }

    pub fn permissions(&self) -> &PermissionStore {
        &self.permissions
    }

    pub fn dialogs(&self) -> &ExtensionDialogStore {
        &self.dialogs
    }

    pub fn sync_cache(&self) -> &SyncCache {
        &self.sync_cache
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Number of full-output fetches still in flight.
    pub fn pending_fetches(&self) -> usize {
        self.fetches.len()
    }

    /// Every message for `session_id`, delivered before the stale guard.
    pub fn session_events(&mut self, session_id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Route one inbound message. Returns how it was classified.
    pub async fn handle(&mut self, message: ServerMessage) -> RouteClass {
        self.notify_observers(&message);

        let class = route(&message, self.active.as_deref());
        match class {
            RouteClass::Ack => {
                self.engine.observe(&message).await;
            }
            RouteClass::Connection => self.on_connection_message(&message),
            RouteClass::Global => self.on_global_message(&message),
            RouteClass::Active => self.on_session_message(&message).await,
            RouteClass::Stale => {
                trace!(
                    message_type = message.message_type(),
                    session_id = ?message.session_id(),
                    "dropped message for inactive session"
                );
            }
        }
        class
    }

    fn notify_observers(&mut self, message: &ServerMessage) {
        let Some(session_id) = message.session_id() else {
            return;
        };
        if let Some(senders) = self.observers.get_mut(session_id) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
            if senders.is_empty() {
                self.observers.remove(session_id);
            }
        }
    }

    fn on_connection_message(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::Connected {
                server_version,
                session,
            } => {
                info!(server_version = ?server_version, "server handshake");
                if let Some(session) = session {
                    self.sessions.upsert(session);
                }
            }
            ServerMessage::Error {
                message: text,
                code,
                fatal,
                ..
            } => {
                warn!(code = ?code, fatal, "server error: {text}");
                if self.active.is_some() {
                    self.timeline.append_error(text, *fatal);
                }
            }
            ServerMessage::Unknown { message_type } => {
                debug!(message_type = %message_type, "ignoring unknown message type");
            }
            _ => {}
        }
    }

    fn on_global_message(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::PermissionRequest {
                session_id,
                id,
                tool,
                input,
                display_summary,
                expires_at,
            } => {
                info!(session_id = %session_id, permission_id = %id, tool = %tool, "permission requested");
                self.permissions.insert(PendingPermission {
                    id: id.clone(),
                    session_id: session_id.clone(),
                    tool: tool.clone(),
                    input: input.clone(),
                    display_summary: display_summary.clone(),
                    expires_at: expires_at.and_then(DateTime::<Utc>::from_timestamp_millis),
                });
                if self.active.as_deref() == Some(session_id.as_str()) {
                    self.timeline
                        .add_permission_placeholder(id, tool, display_summary);
                }
            }
            ServerMessage::PermissionExpired { id, .. } => {
                self.finish_permission(id, PermissionOutcome::Expired);
            }
            ServerMessage::PermissionCancelled { id, .. } => {
                self.finish_permission(id, PermissionOutcome::Cancelled);
            }
            ServerMessage::ExtensionUiRequest {
                session_id,
                id,
                method,
                title,
                message: text,
                options,
                timeout,
            } => {
                debug!(session_id = %session_id, dialog_id = %id, method = %method, "extension dialog");
                self.dialogs.insert(ExtensionDialog {
                    id: id.clone(),
                    session_id: session_id.clone(),
                    method: method.clone(),
                    title: title.clone(),
                    message: text.clone(),
                    options: options.clone(),
                    timeout_ms: *timeout,
                    received_at: Utc::now(),
                });
            }
            ServerMessage::ExtensionUiNotification {
                session_id,
                message: text,
                ..
            } => {
                if self.active.as_deref() == Some(session_id.as_str()) {
                    self.timeline.append_system_event(text);
                }
            }
            _ => {}
        }
    }

    async fn on_session_message(&mut self, message: &ServerMessage) {
        if self.timeline.apply_live(message) {
            match message {
                ServerMessage::AgentStart { session_id } => {
                    self.sessions.set_status(session_id, SessionStatus::Busy);
                }
                ServerMessage::AgentEnd { session_id } => {
                    self.sessions.set_status(session_id, SessionStatus::Ready);
                }
                _ => {}
            }
            return;
        }

        match message {
            ServerMessage::State { session } => {
                self.sessions.upsert(session);
            }
            ServerMessage::SessionEnded { session_id, reason } => {
                self.sessions.remove(session_id);
                let text = match reason {
                    Some(reason) => format!("Session ended: {reason}"),
                    None => "Session ended".to_string(),
                };
                self.timeline.append_system_event(&text);
            }
            ServerMessage::StopRequested { session_id, source } => {
                self.sessions.set_status(session_id, SessionStatus::Stopping);
                let text = match source {
                    Some(source) => format!("Stop requested by {source}"),
                    None => "Stop requested".to_string(),
                };
                self.timeline.append_system_event(&text);
            }
            ServerMessage::StopConfirmed { session_id } => {
                self.sessions.set_status(session_id, SessionStatus::Ready);
                self.timeline.append_system_event("Agent stopped");
            }
            ServerMessage::StopFailed { error, .. } => {
                let text = match error {
                    Some(error) => format!("Stop failed: {error}"),
                    None => "Stop failed".to_string(),
                };
                self.timeline.append_error(&text, false);
            }
            ServerMessage::CompactionStart { reason, .. } => {
                let text = match reason {
                    Some(reason) => format!("Compacting context ({reason})"),
                    None => "Compacting context".to_string(),
                };
                self.timeline.append_system_event(&text);
            }
            ServerMessage::CompactionEnd {
                tokens_before,
                summary,
                aborted,
                ..
            } => {
                if *aborted {
                    self.timeline.append_system_event("Compaction aborted");
                } else {
                    self.timeline
                        .append_system_event(&compaction_message(*tokens_before, summary.as_deref()));
                }
            }
            ServerMessage::RetryStart {
                attempt,
                max_attempts,
                delay_ms,
                error_message,
                ..
            } => {
                let mut text = format!("Retrying ({attempt}/{max_attempts}) in {delay_ms}ms");
                if let Some(error) = error_message {
                    text.push_str(": ");
                    text.push_str(error);
                }
                self.timeline.append_system_event(&text);
            }
            ServerMessage::RetryEnd {
                success,
                attempt,
                final_error,
                ..
            } => {
                if *success {
                    self.timeline
                        .append_system_event(&format!("Retry succeeded on attempt {attempt}"));
                } else {
                    let text = match final_error {
                        Some(error) => format!("Retry failed after attempt {attempt}: {error}"),
                        None => format!("Retry failed after attempt {attempt}"),
                    };
                    self.timeline.append_error(&text, false);
                }
            }
            ServerMessage::Error {
                session_id,
                message: text,
                code,
                fatal,
            } => {
                if is_not_subscribed(code.as_deref(), text)
                    && let Some(session_id) = session_id
                {
                    match self.subscribe(session_id).await {
                        Ok(_) => {
                            info!(session_id = %session_id, "re-subscribed after not_subscribed error");
                            return;
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "re-subscribe failed");
                        }
                    }
                }
                self.timeline.append_error(text, *fatal);
            }
            other => {
                trace!(message_type = other.message_type(), "unhandled session message");
            }
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    async fn subscribe(&self, session_id: &str) -> CommandResult<Option<Value>> {
        let session_id = session_id.to_string();
        self.engine
            .request(move |request_id| ClientMessage::Subscribe {
                session_id: session_id.clone(),
                level: SubscriptionLevel::Full,
                request_id: request_id.to_string(),
            })
            .await
    }

    async fn unsubscribe(&self, session_id: &str) -> CommandResult<Option<Value>> {
        unsubscribe_with(&self.engine, session_id).await
    }

    /// Make `session_id` active and subscribe to it at full level.
    pub async fn enter_session(&mut self, session_id: &str) -> CommandResult<Option<Value>> {
        if let Some(token) = self.cleanups.remove(session_id) {
            debug!(session_id, "cancelled deferred unsubscribe");
            token.cancel();
        }
        if self.active.as_deref().is_some_and(|active| active != session_id) {
            self.leave_session();
        }

        self.cancel_fetches();
        self.timeline.reset();
        self.active = Some(session_id.to_string());
        info!(session_id, "entered session");
        self.subscribe(session_id).await
    }

    /// Subscribe to the active session again, e.g. after a reconnect.
    pub async fn resubscribe(&mut self) -> CommandResult<Option<Value>> {
        let session_id = self.active.clone().ok_or(CommandError::NoActiveSession)?;
        debug!(session_id = %session_id, "re-subscribing");
        self.subscribe(&session_id).await
    }

    /// Leave the active session. The unsubscribe is deferred by the grace
    /// period so a quick return keeps the subscription.
    pub fn leave_session(&mut self) {
        let Some(session_id) = self.active.take() else {
            return;
        };
        self.cancel_fetches();

        let token = CancellationToken::new();
        if let Some(previous) = self.cleanups.insert(session_id.clone(), token.clone()) {
            previous.cancel();
        }
        let engine = self.engine.clone();
        let grace = self.settings.unsubscribe_grace;
        debug!(session_id = %session_id, grace_ms = grace.as_millis() as u64, "scheduled deferred unsubscribe");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Err(e) = unsubscribe_with(&engine, &session_id).await {
                        warn!(session_id = %session_id, error = %e, "deferred unsubscribe failed");
                    }
                }
            }
        });
    }

    /// Tear down `session_id` now: cancel pending cleanups and unsubscribe.
    pub async fn disconnect_session(&mut self, session_id: &str) -> CommandResult<Option<Value>> {
        if let Some(token) = self.cleanups.remove(session_id) {
            token.cancel();
        }
        if self.active.as_deref() == Some(session_id) {
            self.active = None;
            self.cancel_fetches();
            self.timeline.reset();
        }
        info!(session_id, "disconnecting session");
        self.unsubscribe(session_id).await
    }

    /// Apply a history snapshot for the active session.
    pub fn load_session(&mut self, events: &[TraceEvent]) -> ReconcilePlan {
        self.timeline.load_session(events)
    }

    pub fn handle_memory_pressure(&mut self) -> MemoryPressureReport {
        self.timeline.handle_memory_pressure()
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Called when the app returns to the foreground.
    pub async fn on_foreground(&mut self) -> Result<(), TransportError> {
        let status = *self.status.borrow();
        if status == ConnectionStatus::Disconnected {
            info!("reconnecting on foreground");
            self.engine.transport().connect().await?;
        } else {
            debug!(%status, "connection alive on foreground");
        }
        self.resync_if_stale(SyncResource::Sessions, false).await;
        self.resync_if_stale(SyncResource::Workspaces, false).await;
        Ok(())
    }

    /// Refresh a list resource if its last successful sync is too old.
    /// Returns whether a sync succeeded.
    pub async fn resync_if_stale(&mut self, resource: SyncResource, force: bool) -> bool {
        let Some(source) = self.sync_source.clone() else {
            return false;
        };
        if !force
            && !self
                .sync_cache
                .is_stale(resource, self.settings.freshness_threshold)
        {
            let elapsed_ms = self
                .sync_cache
                .elapsed(resource)
                .map_or(0, |elapsed| elapsed.as_millis() as u64);
            debug!(
                resource = resource.as_str(),
                cache_size = self.sync_cache.cache_size(resource),
                elapsed_ms,
                "resync skipped, cache is fresh"
            );
            return false;
        }

        let count = match resource {
            SyncResource::Sessions => match source.fetch_sessions().await {
                Ok(list) => {
                    self.sessions.replace_all(&list);
                    list.len()
                }
                Err(e) => {
                    warn!(resource = resource.as_str(), error = %e, "resync failed");
                    return false;
                }
            },
            SyncResource::Workspaces => match source.fetch_workspaces().await {
                Ok(list) => {
                    self.workspaces = list;
                    self.workspaces.len()
                }
                Err(e) => {
                    warn!(resource = resource.as_str(), error = %e, "resync failed");
                    return false;
                }
            },
        };
        self.sync_cache.record_success(resource, count);
        debug!(resource = resource.as_str(), cache_size = count, "resynced");
        true
    }

    // ========================================================================
    // Turns
    // ========================================================================

    /// Append the user message optimistically, then send it.
    pub async fn send_turn(
        &mut self,
        kind: TurnKind,
        text: &str,
        images: Vec<ImageAttachment>,
        progress: Option<ProgressFn>,
    ) -> CommandResult<Option<Value>> {
        let session_id = self.active.clone().ok_or(CommandError::NoActiveSession)?;
        let image_count = u32::try_from(images.len()).unwrap_or(u32::MAX);
        self.timeline.append_user_message(text, image_count);

        let text = text.to_string();
        self.engine
            .send_turn(progress, move |request_id, turn_id| {
                kind.build(&session_id, &text, &images, request_id, turn_id)
            })
            .await
    }

    pub async fn prompt(
        &mut self,
        text: &str,
        images: Vec<ImageAttachment>,
        progress: Option<ProgressFn>,
    ) -> CommandResult<Option<Value>> {
        self.send_turn(TurnKind::Prompt, text, images, progress).await
    }

    pub async fn steer(&mut self, text: &str) -> CommandResult<Option<Value>> {
        self.send_turn(TurnKind::Steer, text, Vec::new(), None).await
    }

    pub async fn follow_up(&mut self, text: &str) -> CommandResult<Option<Value>> {
        self.send_turn(TurnKind::FollowUp, text, Vec::new(), None).await
    }

    pub async fn stop(&mut self) -> CommandResult<Option<Value>> {
        let session_id = self.active.clone().ok_or(CommandError::NoActiveSession)?;
        self.engine
            .request(move |request_id| ClientMessage::Stop {
                session_id: session_id.clone(),
                request_id: request_id.to_string(),
            })
            .await
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Fork a new session from `entry_id` of the active session.
    pub async fn fork_from_entry(&mut self, entry_id: &str) -> Result<Option<Value>, ForkError> {
        let session_id = self.active.clone().ok_or(CommandError::NoActiveSession)?;
        let busy = self
            .sessions
            .status(&session_id)
            .is_some_and(SessionStatus::is_busy);
        if busy || self.timeline.is_turn_active() {
            return Err(ForkError::TurnInProgress);
        }

        let listing_session = session_id.clone();
        let data = self
            .engine
            .request(move |request_id| ClientMessage::GetForkMessages {
                session_id: listing_session.clone(),
                request_id: request_id.to_string(),
            })
            .await?;
        let entries = forkable_entry_ids(data.as_ref())?;
        if entries.is_empty() {
            return Err(ForkError::NoForkableMessages);
        }

        let wanted = normalize_entry_id(entry_id);
        let Some(target) = entries
            .into_iter()
            .find(|candidate| normalize_entry_id(candidate) == wanted)
        else {
            return Err(ForkError::NotForkable(entry_id.to_string()));
        };

        info!(session_id = %session_id, entry_id = %target, "forking session");
        let result = self
            .engine
            .request(move |request_id| ClientMessage::Fork {
                session_id: session_id.clone(),
                entry_id: target.clone(),
                request_id: request_id.to_string(),
            })
            .await?;
        Ok(result)
    }

    // ========================================================================
    // Permissions and dialogs
    // ========================================================================

    pub async fn respond_to_permission(
        &mut self,
        permission_id: &str,
        action: PermissionAction,
    ) -> CommandResult<Option<Value>> {
        let id = permission_id.to_string();
        let result = self
            .engine
            .request(move |request_id| ClientMessage::PermissionResponse {
                id: id.clone(),
                action,
                request_id: request_id.to_string(),
            })
            .await?;
        let outcome = match action {
            PermissionAction::Allow => PermissionOutcome::Allowed,
            PermissionAction::Deny => PermissionOutcome::Denied,
        };
        self.finish_permission(permission_id, outcome);
        Ok(result)
    }

    /// Remove a permission from the global store. The timeline only gets a
    /// marker when the owning session is active.
    fn finish_permission(&mut self, permission_id: &str, outcome: PermissionOutcome) {
        let Some(permission) = self.permissions.remove(permission_id) else {
            debug!(permission_id, "resolution for unknown permission");
            return;
        };
        debug!(
            permission_id,
            session_id = %permission.session_id,
            outcome = outcome.as_str(),
            "permission resolved"
        );
        if self.active.as_deref() == Some(permission.session_id.as_str()) {
            self.timeline
                .resolve_permission(permission_id, &permission.tool, outcome);
        }
    }

    pub async fn respond_to_dialog(
        &mut self,
        dialog_id: &str,
        answer: DialogAnswer,
    ) -> CommandResult<Option<Value>> {
        let session_id = match self.dialogs.get(dialog_id) {
            Some(dialog) => dialog.session_id.clone(),
            None => self.active.clone().ok_or(CommandError::NoActiveSession)?,
        };
        let id = dialog_id.to_string();
        let result = self
            .engine
            .request(move |request_id| {
                let (value, confirmed, cancelled) = match &answer {
                    DialogAnswer::Value(value) => (Some(value.clone()), None, None),
                    DialogAnswer::Confirmed(confirmed) => (None, Some(*confirmed), None),
                    DialogAnswer::Cancelled => (None, None, Some(true)),
                };
                ClientMessage::ExtensionUiResponse {
                    session_id: session_id.clone(),
                    id: id.clone(),
                    value,
                    confirmed,
                    cancelled,
                    request_id: request_id.to_string(),
                }
            })
            .await?;
        self.dialogs.remove(dialog_id);
        Ok(result)
    }

    /// Expire permissions and dialogs whose deadline passed. Returns
    /// `(permissions, dialogs)` removed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> (usize, usize) {
        let expired = self.permissions.take_expired(now);
        for permission in &expired {
            if self.active.as_deref() == Some(permission.session_id.as_str()) {
                self.timeline.resolve_permission(
                    &permission.id,
                    &permission.tool,
                    PermissionOutcome::Expired,
                );
            }
        }
        let dialogs = self.dialogs.take_expired(now);
        if !expired.is_empty() || !dialogs.is_empty() {
            debug!(
                permissions = expired.len(),
                dialogs = dialogs.len(),
                "swept expired prompts"
            );
        }
        (expired.len(), dialogs.len())
    }

    // ========================================================================
    // Full tool output
    // ========================================================================

    /// Fetch the full body of a tool call in the background. Returns false
    /// when there is nothing to fetch.
    pub fn fetch_full_output(&mut self, item_id: &str) -> bool {
        let (Some(source), Some(session_id)) = (self.output_source.clone(), self.active.clone())
        else {
            return false;
        };
        if !matches!(
            self.timeline.find(item_id),
            Some(TimelineItem::ToolCall { .. })
        ) {
            return false;
        }
        if let Some(previous) = self.fetches.remove(item_id) {
            previous.cancel();
        }

        let token = CancellationToken::new();
        self.fetches.insert(item_id.to_string(), token.clone());
        let tx = self.fetch_tx.clone();
        let item_id = item_id.to_string();
        debug!(session_id = %session_id, item_id = %item_id, "fetching full tool output");
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = source.fetch_full_output(&session_id, &item_id) => result,
            };
            let _ = tx.send(FetchOutcome {
                item_id,
                session_id,
                token,
                result,
            });
        });
        true
    }

    /// Apply finished fetches. Cancelled ones are discarded.
    pub fn apply_fetch_results(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(outcome) = self.fetch_rx.try_recv() {
            if outcome.token.is_cancelled()
                || self.active.as_deref() != Some(outcome.session_id.as_str())
            {
                debug!(item_id = %outcome.item_id, "discarding cancelled fetch");
                continue;
            }
            self.fetches.remove(&outcome.item_id);
            match outcome.result {
                Ok(body) => {
                    if self.timeline.apply_full_output(&outcome.item_id, &body) {
                        applied += 1;
                    }
                }
                Err(e) => {
                    warn!(item_id = %outcome.item_id, error = %e, "full output fetch failed");
                }
            }
        }
        applied
    }

    /// Wait for the next finished fetch and apply it.
    pub async fn next_fetch_result(&mut self) -> bool {
        let Some(outcome) = self.fetch_rx.recv().await else {
            return false;
        };
        if outcome.token.is_cancelled() {
            return false;
        }
        self.fetches.remove(&outcome.item_id);
        match outcome.result {
            Ok(body) => self.timeline.apply_full_output(&outcome.item_id, &body),
            Err(e) => {
                warn!(item_id = %outcome.item_id, error = %e, "full output fetch failed");
                false
            }
        }
    }

    /// Remove a timeline item and cancel its fetch.
    pub fn remove_item(&mut self, item_id: &str) -> bool {
        if let Some(token) = self.fetches.remove(item_id) {
            token.cancel();
        }
        self.timeline.remove_item(item_id)
    }

    /// Append a local notice such as a model change.
    pub fn append_system_event(&mut self, message: &str) -> String {
        self.timeline.append_system_event(message)
    }

    pub fn set_expanded(&mut self, item_id: &str, value: bool) -> bool {
        self.timeline.set_expanded(item_id, value)
    }

    fn cancel_fetches(&mut self) {
        for (item_id, token) in self.fetches.drain() {
            trace!(item_id = %item_id, "cancelling fetch");
            token.cancel();
        }
    }
}

async fn unsubscribe_with(engine: &CommandEngine, session_id: &str) -> CommandResult<Option<Value>> {
    let session_id = session_id.to_string();
    engine
        .request(move |request_id| ClientMessage::Unsubscribe {
            session_id: session_id.clone(),
            request_id: request_id.to_string(),
        })
        .await
}

fn is_not_subscribed(code: Option<&str>, message: &str) -> bool {
    code == Some("not_subscribed") || message.to_lowercase().contains("not subscribed")
}

/// Entry ids from a `get_fork_messages` result, canonical `entryId` first.
fn forkable_entry_ids(data: Option<&Value>) -> Result<Vec<String>, ForkError> {
    let list = match data {
        Some(Value::Array(list)) => list,
        Some(Value::Object(map)) => match map.get("messages") {
            Some(Value::Array(list)) => list,
            _ => {
                return Err(ForkError::InvalidResponse(
                    "missing messages array".to_string(),
                ));
            }
        },
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(ForkError::InvalidResponse(format!(
                "unexpected payload: {other}"
            )));
        }
    };

    Ok(list
        .iter()
        .filter_map(|entry| {
            entry
                .get("entryId")
                .or_else(|| entry.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect())
}
