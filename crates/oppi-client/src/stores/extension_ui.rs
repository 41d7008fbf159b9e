//! Open extension dialogs (select / confirm / input) across all sessions.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDialog {
    pub id: String,
    pub session_id: String,
    pub method: String,
    pub title: Option<String>,
    pub message: Option<String>,
    pub options: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub received_at: DateTime<Utc>,
}

impl ExtensionDialog {
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = i64::try_from(self.timeout_ms?).ok()?;
        Some(self.received_at + chrono::Duration::milliseconds(timeout))
    }
}

#[derive(Debug, Default)]
pub struct ExtensionDialogStore {
    dialogs: Vec<ExtensionDialog>,
}

impl ExtensionDialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dialog: ExtensionDialog) {
        self.dialogs.retain(|d| d.id != dialog.id);
        self.dialogs.push(dialog);
    }

    pub fn remove(&mut self, id: &str) -> Option<ExtensionDialog> {
        let index = self.dialogs.iter().position(|d| d.id == id)?;
        Some(self.dialogs.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&ExtensionDialog> {
        self.dialogs.iter().find(|d| d.id == id)
    }

    pub fn for_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> impl Iterator<Item = &'a ExtensionDialog> + 'a {
        self.dialogs.iter().filter(move |d| d.session_id == session_id)
    }

    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<ExtensionDialog> {
        let (expired, live): (Vec<_>, Vec<_>) = self
            .dialogs
            .drain(..)
            .partition(|d| d.deadline().is_some_and(|at| at <= now));
        self.dialogs = live;
        expired
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }
}
