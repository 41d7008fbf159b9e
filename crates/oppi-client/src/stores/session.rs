//! Known sessions and their lifecycle state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;
use oppi_protocol::{SessionInfo, SessionStatus, Usage};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub workspace_id: Option<String>,
    pub status: SessionStatus,
    pub usage: Usage,
    pub last_activity: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub model: Option<String>,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            workspace_id: None,
            status: SessionStatus::default(),
            usage: Usage::default(),
            last_activity: None,
            name: None,
            model: None,
        }
    }

    fn apply(&mut self, info: &SessionInfo) {
        self.workspace_id = info.workspace_id.clone().or(self.workspace_id.take());
        self.status = info.status;
        self.usage = info.usage.clone();
        if let Some(ms) = info.last_activity {
            self.last_activity = DateTime::<Utc>::from_timestamp_millis(ms).or(self.last_activity);
        }
        if info.name.is_some() {
            self.name = info.name.clone();
        }
        if info.model.is_some() {
            self.model = info.model.clone();
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a server snapshot, creating the session on first sight.
    pub fn upsert(&mut self, info: &SessionInfo) -> &Session {
        let session = self
            .sessions
            .entry(info.id.clone())
            .or_insert_with(|| Session::new(&info.id));
        session.apply(info);
        session
    }

    /// Local optimistic transition, e.g. busy on `agent_start`.
    pub fn set_status(&mut self, id: &str, status: SessionStatus) {
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id));
        if session.status != status {
            debug!("session {id}: {} -> {status}", session.status);
            session.status = status;
        }
        session.last_activity = Some(Utc::now());
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.get(id).map(|s| s.status)
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Replace the whole set with a fresh server listing.
    pub fn replace_all(&mut self, infos: &[SessionInfo]) {
        let mut next = HashMap::with_capacity(infos.len());
        for info in infos {
            let mut session = self
                .sessions
                .remove(&info.id)
                .unwrap_or_else(|| Session::new(&info.id));
            session.apply(info);
            next.insert(info.id.clone(), session);
        }
        self.sessions = next;
    }

    /// Sessions ordered by most recent activity first.
    pub fn list(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
