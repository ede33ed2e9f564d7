//! Caches file stat information so repeated signature checks don't hammer
//! the filesystem.  Thread-safe behind its own lock; the build queue mutex
//! does not cover it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::fs::{self, FileInfo};

pub struct StatCache {
    entries: Mutex<HashMap<String, FileInfo>>,
}

impl StatCache {
    pub fn new() -> StatCache {
        StatCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stat through the cache.
    pub fn stat(&self, path: &str) -> FileInfo {
        if let Some(info) = self.entries.lock().unwrap().get(path) {
            return *info;
        }
        // The stat itself runs outside the lock; two threads may race to
        // stat the same path and insert equivalent results.
        let info = fs::stat(path);
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_string(), info);
        info
    }

    /// Forget any cached info for a path we just wrote, deleted, or created.
    pub fn mark_dirty(&self, path: &str) {
        self.entries.lock().unwrap().remove(path);
    }
}

impl Default for StatCache {
    fn default() -> Self {
        StatCache::new()
    }
}
