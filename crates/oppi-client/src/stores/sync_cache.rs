//! Freshness bookkeeping for list resources.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncResource {
    Sessions,
    Workspaces,
}

impl SyncResource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::Workspaces => "workspaces",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncEntry {
    last_success: Instant,
    cache_size: usize,
}

#[derive(Debug, Default)]
pub struct SyncCache {
    entries: HashMap<SyncResource, SyncEntry>,
}

impl SyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, resource: SyncResource, cache_size: usize) {
        self.entries.insert(
            resource,
            SyncEntry {
                last_success: Instant::now(),
                cache_size,
            },
        );
    }

    /// Time since the last successful sync.
    pub fn elapsed(&self, resource: SyncResource) -> Option<Duration> {
        self.entries
            .get(&resource)
            .map(|entry| entry.last_success.elapsed())
    }

    pub fn cache_size(&self, resource: SyncResource) -> usize {
        self.entries.get(&resource).map_or(0, |entry| entry.cache_size)
    }

    /// Never synced, or synced longer ago than `threshold`.
    pub fn is_stale(&self, resource: SyncResource, threshold: Duration) -> bool {
        self.elapsed(resource).is_none_or(|elapsed| elapsed >= threshold)
    }
}
