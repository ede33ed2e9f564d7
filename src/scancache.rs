//! Caches per-file include-scan results keyed by (path, scanner identity),
//! validated by the file's stat timestamp.  Persisted across builds so warm
//! signature checks never re-lex unchanged sources.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::graph::Guid;

/// One resolved include reference discovered in a file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanInclude {
    pub path: String,
    /// Whether the included file is itself scanned for further includes.
    pub follow: bool,
}

#[derive(Clone, Serialize, Deserialize)]
struct Record {
    timestamp: u64,
    includes: Vec<ScanInclude>,
}

#[derive(Serialize, Deserialize)]
struct Entry {
    scanner: Guid,
    path: String,
    timestamp: u64,
    includes: Vec<ScanInclude>,
}

#[derive(Default, Serialize, Deserialize)]
struct ScanCacheFile {
    entries: Vec<Entry>,
}

pub struct ScanCache {
    entries: Mutex<HashMap<(Guid, String), Record>>,
}

impl ScanCache {
    pub fn new() -> ScanCache {
        ScanCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(path: &str) -> ScanCache {
        let mut map = HashMap::new();
        if let Some(file) = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ScanCacheFile>(&bytes).ok())
        {
            for e in file.entries {
                map.insert(
                    (e.scanner, e.path),
                    Record {
                        timestamp: e.timestamp,
                        includes: e.includes,
                    },
                );
            }
        }
        ScanCache {
            entries: Mutex::new(map),
        }
    }

    /// Cached direct includes for (scanner, path), valid only if the file's
    /// timestamp still matches what the entry was computed against.
    pub fn get(&self, scanner: &Guid, path: &str, timestamp: u64) -> Option<Vec<ScanInclude>> {
        let entries = self.entries.lock().unwrap();
        let record = entries.get(&(*scanner, path.to_string()))?;
        if record.timestamp != timestamp {
            return None;
        }
        Some(record.includes.clone())
    }

    pub fn set(&self, scanner: &Guid, path: &str, timestamp: u64, includes: Vec<ScanInclude>) {
        self.entries.lock().unwrap().insert(
            (*scanner, path.to_string()),
            Record {
                timestamp,
                includes,
            },
        );
    }

    pub fn save(&self, path: &str, tmp_path: &str) -> anyhow::Result<()> {
        let entries = self.entries.lock().unwrap();
        let mut file = ScanCacheFile {
            entries: entries
                .iter()
                .map(|((scanner, path), record)| Entry {
                    scanner: *scanner,
                    path: path.clone(),
                    timestamp: record.timestamp,
                    includes: record.includes.clone(),
                })
                .collect(),
        };
        drop(entries);
        // Stable output keeps the file diffable between runs.
        file.entries
            .sort_by(|a, b| (a.scanner, &a.path).cmp(&(b.scanner, &b.path)));

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

impl Default for ScanCache {
    fn default() -> Self {
        ScanCache::new()
    }
}
