//! Command/acknowledgement engine.
//!
//! Every command gets a fresh `requestId` per physical attempt. Turn commands
//! (prompt, steer, follow-up) also carry a `turnId` that is stable across
//! retries of the same user action so the server can de-duplicate them.
//!
//! A command resolves exactly once, by the first of:
//! 1. a `command_result` for its requestId (failure is a rejection, never retried),
//! 2. a `turn_ack` at or beyond [`ACK_SUFFICIENT_STAGE`] for its turnId,
//! 3. the ack timeout (terminal, never retried).
//!
//! Transport failures before the message left are retried once with the
//! same turnId.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use oppi_protocol::{AckStage, ClientMessage, ServerMessage};
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio::time;
use tracing::{debug, warn};

use crate::error::{CommandError, CommandResult};
use crate::transport::Transport;

/// Lowest ack stage that counts as delivered without an explicit result.
pub const ACK_SUFFICIENT_STAGE: AckStage = AckStage::Dispatched;

/// Called with every ack stage seen for a turn, in arrival order. Keeps
/// firing after the turn is delivered, until its final stage.
pub type ProgressFn = Arc<dyn Fn(AckStage) + Send + Sync>;

/// Last stage a turn reports. Progress reporting for the turn ends here.
const FINAL_PROGRESS_STAGE: AckStage = AckStage::Started;

/// How long a delivered turn keeps reporting progress when its final stage
/// never arrives.
const PROGRESS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub ack_timeout: Duration,
    pub max_send_attempts: u32,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(15),
            max_send_attempts: 2,
        }
    }
}

#[derive(Debug)]
enum Resolution {
    Success(Option<Value>),
    Rejected(String),
}

struct PendingRequest {
    command: &'static str,
    turn_id: Option<String>,
    seq: u64,
    waiter: oneshot::Sender<Resolution>,
}

/// Progress subscription of one logical turn. Outlives the request so stages
/// after delivery still reach the callback.
struct TurnProgress {
    callback: ProgressFn,
    reported: Vec<AckStage>,
    registered: Instant,
}

/// In-flight requests keyed by requestId, with a turnId index.
#[derive(Default)]
struct PendingTable {
    by_request: HashMap<String, PendingRequest>,
    by_turn: HashMap<String, String>,
    progress: HashMap<String, TurnProgress>,
    next_seq: u64,
}

impl PendingTable {
    fn insert(
        &mut self,
        request_id: String,
        command: &'static str,
        turn_id: Option<String>,
    ) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        if let Some(turn) = &turn_id {
            self.by_turn.insert(turn.clone(), request_id.clone());
        }
        self.next_seq += 1;
        self.by_request.insert(
            request_id,
            PendingRequest {
                command,
                turn_id,
                seq: self.next_seq,
                waiter: tx,
            },
        );
        rx
    }

    fn remove(&mut self, request_id: &str) -> Option<PendingRequest> {
        let entry = self.by_request.remove(request_id)?;
        if let Some(turn) = &entry.turn_id
            && self.by_turn.get(turn).map(String::as_str) == Some(request_id)
        {
            self.by_turn.remove(turn);
        }
        Some(entry)
    }

    fn watch_progress(&mut self, turn_id: &str, callback: ProgressFn) {
        self.progress
            .retain(|_, watch| watch.registered.elapsed() < PROGRESS_TTL);
        self.progress.insert(
            turn_id.to_string(),
            TurnProgress {
                callback,
                reported: Vec::new(),
                registered: Instant::now(),
            },
        );
    }

    /// Callback to notify for `stage`, once per stage and turn.
    fn progress_for(&mut self, turn_id: &str, stage: AckStage) -> Option<ProgressFn> {
        let watch = self.progress.get_mut(turn_id)?;
        if watch.reported.contains(&stage) {
            return None;
        }
        watch.reported.push(stage);
        let callback = Arc::clone(&watch.callback);
        if stage == FINAL_PROGRESS_STAGE {
            self.progress.remove(turn_id);
        }
        Some(callback)
    }

    /// Oldest pending request for `command`. Used when a result carries no requestId.
    fn oldest_for_command(&self, command: &str) -> Option<String> {
        self.by_request
            .iter()
            .filter(|(_, entry)| entry.command == command)
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(id, _)| id.clone())
    }
}

#[derive(Clone)]
pub struct CommandEngine {
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingTable>>,
    settings: CommandSettings,
}

impl CommandEngine {
    pub fn new(transport: Arc<dyn Transport>, settings: CommandSettings) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(PendingTable::default())),
            settings,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    /// Send a turn command. `build` receives `(request_id, turn_id)`.
    pub async fn send_turn<F>(
        &self,
        progress: Option<ProgressFn>,
        build: F,
    ) -> CommandResult<Option<Value>>
    where
        F: Fn(&str, &str) -> ClientMessage + Send + Sync,
    {
        let turn_id = new_id();
        self.execute(Some(turn_id.clone()), progress, |request_id| {
            build(request_id, &turn_id)
        })
        .await
    }

    /// Send a non-turn command. Only an explicit result resolves it.
    pub async fn request<F>(&self, build: F) -> CommandResult<Option<Value>>
    where
        F: Fn(&str) -> ClientMessage + Send + Sync,
    {
        self.execute(None, None, build).await
    }

    async fn execute<F>(
        &self,
        turn_id: Option<String>,
        progress: Option<ProgressFn>,
        build: F,
    ) -> CommandResult<Option<Value>>
    where
        F: Fn(&str) -> ClientMessage + Send + Sync,
    {
        if let (Some(turn), Some(callback)) = (turn_id.as_deref(), progress) {
            self.pending.lock().await.watch_progress(turn, callback);
        }

        let result = self.send_with_retry(turn_id.as_deref(), &build).await;
        if result.is_err()
            && let Some(turn) = turn_id.as_deref()
        {
            self.pending.lock().await.progress.remove(turn);
        }
        result
    }

    async fn send_with_retry<F>(
        &self,
        turn_id: Option<&str>,
        build: &F,
    ) -> CommandResult<Option<Value>>
    where
        F: Fn(&str) -> ClientMessage + Send + Sync,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let request_id = new_id();
            let message = build(&request_id);
            let command = message.command_name();

            // Register before sending so an eager ack cannot be missed.
            let rx = self.pending.lock().await.insert(
                request_id.clone(),
                command,
                turn_id.map(str::to_string),
            );

            match self.transport.send(&message).await {
                Ok(()) => {
                    debug!(command, request_id = %request_id, turn_id = ?turn_id, attempts, "command sent");
                    return self.await_resolution(&request_id, command, rx).await;
                }
                Err(e) => {
                    self.pending.lock().await.remove(&request_id);
                    if e.is_retryable() && attempts < self.settings.max_send_attempts {
                        debug!(command, attempts, error = %e, "send failed, retrying");
                        continue;
                    }
                    warn!(command, attempts, error = %e, "send failed");
                    return Err(CommandError::Transport {
                        command: command.to_string(),
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }

    async fn await_resolution(
        &self,
        request_id: &str,
        command: &'static str,
        rx: oneshot::Receiver<Resolution>,
    ) -> CommandResult<Option<Value>> {
        let waited = self.settings.ack_timeout;
        match time::timeout(waited, rx).await {
            Ok(Ok(Resolution::Success(data))) => Ok(data),
            Ok(Ok(Resolution::Rejected(reason))) => Err(CommandError::Rejected {
                command: command.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(CommandError::Dropped),
            Err(_) => {
                self.pending.lock().await.remove(request_id);
                warn!(command, request_id, "command timed out waiting for acknowledgement");
                Err(CommandError::Timeout {
                    command: command.to_string(),
                    waited,
                })
            }
        }
    }

    /// Apply an inbound message to the pending table.
    ///
    /// Returns true for command acknowledgement messages. Safe to call more
    /// than once with the same message.
    pub async fn observe(&self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::TurnAck { turn_id, stage, .. } => {
                self.on_ack(turn_id, *stage).await;
                true
            }
            ServerMessage::CommandResult {
                command,
                request_id,
                success,
                data,
                error,
                ..
            } => {
                self.on_result(command, request_id.as_deref(), *success, data, error)
                    .await;
                true
            }
            _ => false,
        }
    }

    async fn on_ack(&self, turn_id: &str, stage: AckStage) {
        let progress = {
            let mut pending = self.pending.lock().await;
            if stage.rank() >= ACK_SUFFICIENT_STAGE.rank()
                && let Some(request_id) = pending.by_turn.get(turn_id).cloned()
                && let Some(entry) = pending.remove(&request_id)
            {
                debug!(
                    command = entry.command,
                    request_id = %request_id,
                    turn_id,
                    stage = stage.as_str(),
                    "delivered by ack"
                );
                let _ = entry.waiter.send(Resolution::Success(None));
            }
            pending.progress_for(turn_id, stage)
        };

        if let Some(progress) = progress {
            progress(stage);
        }
    }

    async fn on_result(
        &self,
        command: &str,
        request_id: Option<&str>,
        success: bool,
        data: &Option<Value>,
        error: &Option<String>,
    ) {
        let mut pending = self.pending.lock().await;
        let key = match request_id {
            Some(id) => id.to_string(),
            None => match pending.oldest_for_command(command) {
                Some(id) => id,
                None => return,
            },
        };
        let Some(entry) = pending.remove(&key) else {
            return;
        };

        let resolution = if success {
            Resolution::Success(data.clone())
        } else {
            Resolution::Rejected(
                error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        };
        debug!(command, request_id = %key, success, "command result");
        let _ = entry.waiter.send(resolution);
    }

    /// Number of unresolved requests.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.by_request.len()
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
