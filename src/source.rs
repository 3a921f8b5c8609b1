//! Memoized source text for one debugging run.
//!
//! Shader source does not change while the debuggee is running, so entries
//! are write-once and never evicted. One cache instance is shared by every
//! session client talking to the same session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub type SourceLines = Arc<Vec<String>>;

#[derive(Default)]
pub struct SourceCache {
    by_path: Mutex<HashMap<String, SourceLines>>,
    by_ref: Mutex<HashMap<i64, SourceLines>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_path(&self, path: &str) -> Option<SourceLines> {
        self.by_path.lock().get(path).cloned()
    }

    pub fn insert_path(&self, path: &str, lines: Vec<String>) -> SourceLines {
        let lines = Arc::new(lines);
        self.by_path
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| lines.clone())
            .clone()
    }

    pub fn get_ref(&self, reference: i64) -> Option<SourceLines> {
        self.by_ref.lock().get(&reference).cloned()
    }

    pub fn insert_ref(&self, reference: i64, lines: Vec<String>) -> SourceLines {
        let lines = Arc::new(lines);
        self.by_ref
            .lock()
            .entry(reference)
            .or_insert_with(|| lines.clone())
            .clone()
    }
}

/// Splits fetched source content into lines, keeping empty lines.
pub fn split_lines(content: &str) -> Vec<String> {
    content.split('\n').map(|s| s.to_string()).collect()
}
