//! Pending permission requests across all sessions.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub id: String,
    pub session_id: String,
    pub tool: String,
    pub input: Value,
    pub display_summary: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PendingPermission {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Global store, independent of which session is active. Arrival order is kept.
#[derive(Debug, Default)]
pub struct PermissionStore {
    entries: Vec<PendingPermission>,
}

impl PermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request. A repeated id replaces the earlier entry in place.
    pub fn insert(&mut self, permission: PendingPermission) {
        if let Some(existing) = self.entries.iter_mut().find(|p| p.id == permission.id) {
            *existing = permission;
        } else {
            debug!(
                "pending permission {} for session {}",
                permission.id, permission.session_id
            );
            self.entries.push(permission);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<PendingPermission> {
        let index = self.entries.iter().position(|p| p.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&PendingPermission> {
        self.entries.iter().find(|p| p.id == id)
    }

    pub fn for_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> impl Iterator<Item = &'a PendingPermission> + 'a {
        self.entries.iter().filter(move |p| p.session_id == session_id)
    }

    pub fn all(&self) -> &[PendingPermission] {
        &self.entries
    }

    /// Remove and return every request past its expiry.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<PendingPermission> {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|p| p.is_expired(now));
        self.entries = live;
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn permission(id: &str, session: &str, expires_at: Option<DateTime<Utc>>) -> PendingPermission {
        PendingPermission {
            id: id.to_string(),
            session_id: session.to_string(),
            tool: "bash".to_string(),
            input: Value::Null,
            display_summary: "ls".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let mut store = PermissionStore::new();
        store.insert(permission("p1", "s1", None));
        store.insert(permission("p2", "s2", None));
        assert_eq!(store.len(), 2);
        assert_eq!(store.for_session("s2").count(), 1);
        assert_eq!(store.remove("p1").unwrap().session_id, "s1");
        assert!(store.remove("p1").is_none());
    }

    #[test]
    fn test_duplicate_id_replaces() {
        let mut store = PermissionStore::new();
        store.insert(permission("p1", "s1", None));
        let mut updated = permission("p1", "s1", None);
        updated.display_summary = "rm -rf target".to_string();
        store.insert(updated);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("p1").unwrap().display_summary, "rm -rf target");
    }

    #[test]
    fn test_take_expired() {
        let now = Utc::now();
        let mut store = PermissionStore::new();
        store.insert(permission("old", "s1", Some(now - Duration::seconds(5))));
        store.insert(permission("fresh", "s1", Some(now + Duration::seconds(60))));
        store.insert(permission("forever", "s2", None));

        let expired = store.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
        assert_eq!(store.len(), 2);
    }
}
