//! File metadata, as consulted through the stat cache.

use std::path::Path;

/// Stat info gathered for a file.  This also models "file is absent"; not an
/// Option<> just because it makes the code using it easier to follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub exists: bool,
    /// Modification time in OS ticks (nanoseconds where available); 0 when
    /// absent.  Compared with strict equality, never ordering.
    pub timestamp: u64,
}

impl FileInfo {
    pub fn missing() -> FileInfo {
        FileInfo {
            exists: false,
            timestamp: 0,
        }
    }
}

#[cfg(unix)]
fn mtime_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    (meta.mtime() as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(meta.mtime_nsec() as u64)
}

#[cfg(not(unix))]
fn mtime_of(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// stat() an on-disk path.  Any error reads as "missing"; a file we cannot
/// stat is a file we cannot depend on.
pub fn stat(path: &str) -> FileInfo {
    match std::fs::metadata(path) {
        Ok(meta) => FileInfo {
            exists: true,
            timestamp: mtime_of(&meta),
        },
        Err(_) => FileInfo::missing(),
    }
}

/// Remove a path that may be either a file or a directory.  Removing a
/// non-empty directory fails and that failure is reported as Err; callers
/// that rely on the can't-rmdir-non-empty behavior ignore the result.
pub fn remove_file_or_dir(path: &str) -> std::io::Result<()> {
    let p = Path::new(path);
    match std::fs::symlink_metadata(p) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir(p),
        Ok(_) => std::fs::remove_file(p),
        Err(err) => Err(err),
    }
}
