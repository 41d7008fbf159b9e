//! Byte-capped store of tool call arguments.

use std::collections::HashMap;

use log::debug;
use serde_json::Value;

#[derive(Debug)]
struct ArgsEntry {
    args: Option<Value>,
    size_bytes: usize,
    seq: u64,
}

#[derive(Debug)]
pub struct ToolArgsStore {
    item_cap: usize,
    total_cap: usize,
    entries: HashMap<String, ArgsEntry>,
    total_bytes: usize,
    next_seq: u64,
}

impl ToolArgsStore {
    pub fn new(item_cap: usize, total_cap: usize) -> Self {
        Self {
            item_cap,
            total_cap,
            entries: HashMap::new(),
            total_bytes: 0,
            next_seq: 0,
        }
    }

    /// Store the arguments for `id`. Oversized arguments are recorded by
    /// size only.
    pub fn insert(&mut self, id: &str, args: &Value) {
        self.remove(id);
        let size_bytes = serde_json::to_string(args).map(|s| s.len()).unwrap_or(0);
        self.next_seq += 1;

        let stored = if size_bytes > self.item_cap {
            debug!("tool args for {id} exceed {} bytes, keeping size only", self.item_cap);
            None
        } else {
            self.total_bytes += size_bytes;
            Some(args.clone())
        };

        self.entries.insert(
            id.to_string(),
            ArgsEntry {
                args: stored,
                size_bytes,
                seq: self.next_seq,
            },
        );
        self.enforce_total_cap(id);
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.entries.get(id)?.args.as_ref()
    }

    /// Serialized size of the arguments, even when the body was dropped.
    pub fn size_of(&self, id: &str) -> Option<usize> {
        self.entries.get(id).map(|entry| entry.size_bytes)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                if entry.args.is_some() {
                    self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every argument body. Returns `(bytes, bodies)` freed.
    pub fn clear_bodies(&mut self) -> (usize, usize) {
        let mut freed_bytes = 0;
        let mut freed_items = 0;
        for entry in self.entries.values_mut() {
            if entry.args.take().is_some() {
                freed_bytes += entry.size_bytes;
                freed_items += 1;
            }
        }
        self.total_bytes = 0;
        (freed_bytes, freed_items)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn enforce_total_cap(&mut self, keep: &str) {
        while self.total_bytes > self.total_cap {
            let oldest = self
                .entries
                .iter()
                .filter(|(id, entry)| id.as_str() != keep && entry.args.is_some())
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else {
                break;
            };
            if let Some(entry) = self.entries.get_mut(&oldest)
                && entry.args.take().is_some()
            {
                self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get() {
        let mut store = ToolArgsStore::new(1000, 10_000);
        store.insert("tc1", &json!({"path": "src/main.rs"}));
        assert_eq!(store.get("tc1"), Some(&json!({"path": "src/main.rs"})));
        assert_eq!(store.total_bytes(), store.size_of("tc1").unwrap());
    }

    #[test]
    fn test_oversized_args_keep_size_only() {
        let mut store = ToolArgsStore::new(10, 10_000);
        store.insert("tc1", &json!({"content": "a very long file body"}));
        assert!(store.get("tc1").is_none());
        assert!(store.size_of("tc1").unwrap() > 10);
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn test_total_cap_evicts_oldest() {
        let mut store = ToolArgsStore::new(100, 30);
        store.insert("a", &json!({"k": "aaaaaaaa"}));
        store.insert("b", &json!({"k": "bbbbbbbb"}));
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        assert!(store.total_bytes() <= 30);
    }

    #[test]
    fn test_reinsert_replaces() {
        let mut store = ToolArgsStore::new(1000, 10_000);
        store.insert("a", &json!({"k": 1}));
        store.insert("a", &json!({"k": 2}));
        assert_eq!(store.get("a"), Some(&json!({"k": 2})));
        assert_eq!(store.total_bytes(), store.size_of("a").unwrap());
    }
}
