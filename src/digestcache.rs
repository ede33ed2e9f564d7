//! Caches content digests keyed by (path, stat identity) so unchanged files
//! are hashed at most once across builds.  Persisted beside the build state.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::hash::{digest_bytes, HashDigest};

#[derive(Clone, Serialize, Deserialize)]
struct Record {
    /// Stat identity the digest was computed against.
    timestamp: u64,
    /// Last build that consulted this record, for aging out dead entries.
    access_time: u64,
    digest: HashDigest,
}

#[derive(Default, Serialize, Deserialize)]
struct DigestCacheFile {
    records: HashMap<String, Record>,
}

pub struct DigestCache {
    // One lock for the whole table: recomputation is serialized so two
    // workers never double-hash the same file.
    entries: Mutex<HashMap<String, Record>>,
    /// Snapshot of what the cache file held at load time; change reporting
    /// compares fresh digests against it.
    loaded: HashMap<String, HashDigest>,
    now: u64,
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl DigestCache {
    pub fn new() -> DigestCache {
        DigestCache {
            entries: Mutex::new(HashMap::new()),
            loaded: HashMap::new(),
            now: now_seconds(),
        }
    }

    /// Load the persisted cache; a missing or unreadable file is an empty
    /// cache, never an error.
    pub fn load(path: &str) -> DigestCache {
        let records = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<DigestCacheFile>(&bytes).ok())
            .map(|f| f.records)
            .unwrap_or_default();
        let loaded = records
            .iter()
            .map(|(k, v)| (k.clone(), v.digest))
            .collect();
        DigestCache {
            entries: Mutex::new(records),
            loaded,
            now: now_seconds(),
        }
    }

    /// Content digest for a file whose current stat timestamp is `timestamp`.
    /// Recomputes (and re-caches) on any stat-identity mismatch.  Returns
    /// None if the file cannot be read.
    pub fn digest(&self, path: &str, timestamp: u64) -> Option<HashDigest> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(record) = entries.get_mut(path) {
            if record.timestamp == timestamp {
                record.access_time = self.now;
                return Some(record.digest);
            }
        }
        let bytes = std::fs::read(path).ok()?;
        let digest = digest_bytes(&bytes);
        entries.insert(
            path.to_string(),
            Record {
                timestamp,
                access_time: self.now,
                digest,
            },
        );
        Some(digest)
    }

    /// Whether the file's content digest differs from what the cache held at
    /// load time.  Used for change reporting once a signature mismatch has
    /// already been established.
    pub fn has_changed(&self, path: &str, timestamp: u64) -> bool {
        match (self.digest(path, timestamp), self.loaded.get(path)) {
            (Some(fresh), Some(old)) => fresh != *old,
            _ => true,
        }
    }

    /// Persist via temp file + rename.  Entries not consulted within the
    /// keep window are dropped.
    pub fn save(&self, path: &str, tmp_path: &str, keep_days: u32) -> anyhow::Result<()> {
        let entries = self.entries.lock().unwrap();
        let cutoff = if keep_days == 0 {
            0
        } else {
            self.now.saturating_sub(keep_days as u64 * 24 * 60 * 60)
        };
        let records: HashMap<String, Record> = entries
            .iter()
            .filter(|(_, r)| r.access_time >= cutoff)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        drop(entries);

        let file = DigestCacheFile { records };
        let mut f = std::fs::File::create(tmp_path)?;
        f.write_all(&serde_json::to_vec(&file)?)?;
        drop(f);
        if let Err(err) = std::fs::rename(tmp_path, path) {
            let _ = std::fs::remove_file(tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

impl Default for DigestCache {
    fn default() -> Self {
        DigestCache::new()
    }
}
