//! Implicit-dependency scanning: given a source file and a scanner
//! configuration, produce the set of files it transitively includes.
//!
//! The lexical side is deliberately small: a line-oriented match of the
//! configured keywords followed by a quoted, angle-bracketed, or bare path.
//! What matters for correctness is the contract: deterministic output for a
//! given cache snapshot, only files that exist on disk, resolution relative
//! to the including file and then the configured include paths.

use std::collections::HashSet;

use crate::graph::{FileAndHash, ScannerConfig, ScannerKind};
use crate::scancache::{ScanCache, ScanInclude};
use crate::smallmap::SmallMap;
use crate::statcache::StatCache;

/// A keyword match found at the start of a (trimmed) line.
struct IncludeRef {
    target: String,
    /// Angle-bracket or bare-when-configured references skip the
    /// includer-relative lookup.
    system: bool,
    follow: bool,
}

fn lex_target(rest: &str, bare_means_system: bool, follow: bool) -> Option<IncludeRef> {
    let rest = rest.trim_start();
    let mut chars = rest.chars();
    match chars.next()? {
        '"' => {
            let end = rest[1..].find('"')?;
            Some(IncludeRef {
                target: rest[1..1 + end].to_string(),
                system: false,
                follow,
            })
        }
        '<' => {
            let end = rest[1..].find('>')?;
            Some(IncludeRef {
                target: rest[1..1 + end].to_string(),
                system: true,
                follow,
            })
        }
        _ => {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            if end == 0 {
                return None;
            }
            Some(IncludeRef {
                target: rest[..end].to_string(),
                system: bare_means_system,
                follow,
            })
        }
    }
}

fn lex_line(config: &ScannerConfig, keywords: &SmallMap<&str, bool>, line: &str) -> Option<IncludeRef> {
    let rest = line.trim_start();
    match config.kind {
        ScannerKind::Cpp => {
            let rest = rest.strip_prefix('#')?.trim_start();
            let rest = rest.strip_prefix("include")?;
            lex_target(rest, false, true)
        }
        ScannerKind::Generic => {
            for &(word, follow) in keywords.iter() {
                if let Some(after) = rest.strip_prefix(word) {
                    if config.require_whitespace
                        && !after.chars().next().is_some_and(char::is_whitespace)
                    {
                        continue;
                    }
                    return lex_target(after, config.bare_means_system, follow);
                }
            }
            None
        }
    }
}

fn join_dir(dir: &str, target: &str) -> String {
    if dir.is_empty() || dir == "." {
        target.to_string()
    } else {
        format!("{}/{}", dir, target)
    }
}

fn dir_of(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn resolve(
    stat_cache: &StatCache,
    config: &ScannerConfig,
    includer: &str,
    r: &IncludeRef,
) -> Option<String> {
    if r.target.starts_with('/') {
        return stat_cache.stat(&r.target).exists.then(|| r.target.clone());
    }
    if !r.system {
        let candidate = join_dir(dir_of(includer), &r.target);
        if stat_cache.stat(&candidate).exists {
            return Some(candidate);
        }
    }
    for dir in &config.include_paths {
        let candidate = join_dir(dir, &r.target);
        if stat_cache.stat(&candidate).exists {
            return Some(candidate);
        }
    }
    None
}

/// Direct includes of one file, through the scan cache.
fn direct_includes(
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
    config: &ScannerConfig,
    keywords: &SmallMap<&str, bool>,
    path: &str,
) -> Vec<ScanInclude> {
    let info = stat_cache.stat(path);
    if !info.exists {
        return Vec::new();
    }
    if let Some(cached) = scan_cache.get(&config.guid, path, info.timestamp) {
        return cached;
    }

    let mut includes = Vec::new();
    if let Ok(bytes) = std::fs::read(path) {
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            if let Some(r) = lex_line(config, keywords, line) {
                if let Some(resolved) = resolve(stat_cache, config, path, &r) {
                    includes.push(ScanInclude {
                        path: resolved,
                        follow: r.follow,
                    });
                }
            }
        }
    }
    scan_cache.set(&config.guid, path, info.timestamp, includes.clone());
    includes
}

/// All files transitively included by `file`.  Only files that exist on disk
/// are reported; the walk order is a depth-first traversal, deterministic
/// for a given cache snapshot.
pub fn scan_implicit_deps(
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
    config: &ScannerConfig,
    file: &str,
) -> Vec<FileAndHash> {
    let keywords: SmallMap<&str, bool> = {
        let mut m = SmallMap::new();
        for kw in &config.keywords {
            m.insert(kw.word.as_str(), kw.should_follow);
        }
        m
    };

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(file.to_string());
    let mut out = Vec::new();
    let mut stack = vec![file.to_string()];

    while let Some(current) = stack.pop() {
        for inc in direct_includes(stat_cache, scan_cache, config, &keywords, &current) {
            if visited.insert(inc.path.clone()) {
                out.push(FileAndHash::new(&inc.path));
                if inc.follow {
                    stack.push(inc.path);
                }
            }
        }
    }
    out
}
