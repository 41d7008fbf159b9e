//! Byte-capped store of tool output bodies.
//!
//! Each item keeps a short preview that survives eviction and memory
//! pressure. Full bodies are capped per item (overflow is cut and marked) and
//! in aggregate (overflow evicts the oldest bodies).

use std::collections::HashMap;

use log::debug;

/// Appended to a body that hit the per-item cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Bytes of each body kept as a preview.
pub const PREVIEW_BYTES: usize = 1024;

#[derive(Debug, Default)]
struct OutputEntry {
    body: Option<String>,
    preview: String,
    truncated: bool,
    seq: u64,
}

#[derive(Debug)]
pub struct ToolOutputStore {
    item_cap: usize,
    total_cap: usize,
    entries: HashMap<String, OutputEntry>,
    total_bytes: usize,
    next_seq: u64,
}

impl ToolOutputStore {
    pub fn new(item_cap: usize, total_cap: usize) -> Self {
        Self {
            item_cap,
            total_cap,
            entries: HashMap::new(),
            total_bytes: 0,
            next_seq: 0,
        }
    }

    /// Append a streamed chunk to the body of `id`.
    ///
    /// Once a body has been evicted, later chunks only grow the preview.
    pub fn append(&mut self, id: &str, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let item_cap = self.item_cap;
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| OutputEntry {
                body: Some(String::new()),
                ..OutputEntry::default()
            });
        entry.seq = seq;
        if entry.truncated {
            return;
        }

        let Some(body) = entry.body.as_mut() else {
            let room = PREVIEW_BYTES.saturating_sub(entry.preview.len());
            entry
                .preview
                .push_str(truncate_at_char_boundary(chunk, room));
            return;
        };

        let before = body.len();
        let room = item_cap.saturating_sub(body.len());
        if chunk.len() <= room {
            body.push_str(chunk);
        } else {
            body.push_str(truncate_at_char_boundary(chunk, room));
            body.push_str(TRUNCATION_MARKER);
            entry.truncated = true;
            debug!("tool output {id} hit the per-item cap of {item_cap} bytes");
        }
        let added = body.len() - before;

        if entry.preview.len() < PREVIEW_BYTES {
            entry.preview = truncate_at_char_boundary(body, PREVIEW_BYTES).to_string();
        }

        self.total_bytes += added;
        self.enforce_total_cap(id);
    }

    /// Replace the body of `id` with a complete output.
    pub fn set(&mut self, id: &str, output: &str) {
        self.remove(id);
        self.append(id, output);
    }

    pub fn full_output(&self, id: &str) -> Option<&str> {
        self.entries.get(id)?.body.as_deref()
    }

    pub fn preview(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|entry| entry.preview.as_str())
    }

    pub fn is_truncated(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.truncated)
    }

    /// Whether the preview is all that is left of `id`.
    pub fn is_evicted(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.body.is_none())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                let size = entry.body.map_or(0, |body| body.len());
                self.total_bytes = self.total_bytes.saturating_sub(size);
                true
            }
            None => false,
        }
    }

    /// Drop every full body, keeping previews. Returns `(bytes, bodies)` freed.
    pub fn clear_bodies(&mut self) -> (usize, usize) {
        let mut freed_bytes = 0;
        let mut freed_items = 0;
        for entry in self.entries.values_mut() {
            if let Some(body) = entry.body.take() {
                freed_bytes += body.len();
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

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn enforce_total_cap(&mut self, keep: &str) {
        while self.total_bytes > self.total_cap {
            let oldest = self
                .entries
                .iter()
                .filter(|(id, entry)| id.as_str() != keep && entry.body.is_some())
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else {
                break;
            };
            if let Some(body) = self
                .entries
                .get_mut(&oldest)
                .and_then(|entry| entry.body.take())
            {
                self.total_bytes = self.total_bytes.saturating_sub(body.len());
                debug!("evicted tool output body {oldest} ({} bytes)", body.len());
            }
        }
    }
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a char.
pub(crate) fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
