//! Input-signature computation and the rebuild decision.
//!
//! A node's signature is a deterministic function of its action text,
//! pre-action, explicit inputs (path + per-file signature), deduplicated
//! implicit inputs, allowed output substrings, and the two validation flags.
//! Per-file signatures are the file's timestamp, or its content digest when
//! the file's extension is on the DAG's digest-signing list.

use std::collections::BTreeSet;

use serde_json::json;

use crate::digestcache::DigestCache;
use crate::graph::{FileAndHash, NodeData};
use crate::hash::{djb2_hash, HashDigest, HashState};
use crate::scancache::ScanCache;
use crate::scanner;
use crate::statcache::StatCache;
use crate::statefile::NodeStateRecord;
use crate::structlog;

pub struct SignatureEnv<'a> {
    pub stat_cache: &'a StatCache,
    pub digest_cache: &'a DigestCache,
    pub scan_cache: &'a ScanCache,
    /// DJB2 hashes of extensions (including the dot) signed by content.
    pub content_digest_extensions: &'a [u32],
}

fn should_use_digest(path: &str, extensions: &[u32]) -> bool {
    let ext = match path.rfind('.') {
        Some(idx) => &path[idx..],
        None => return false,
    };
    let ext_hash = djb2_hash(ext);
    extensions.contains(&ext_hash)
}

/// Whether a given input is signed by timestamp rather than content digest.
pub fn uses_timestamp_signing(env: &SignatureEnv, path: &str, force_timestamp: bool) -> bool {
    force_timestamp || !should_use_digest(path, env.content_digest_extensions)
}

fn add_file_signature(h: &mut HashState, env: &SignatureEnv, path: &str, force_timestamp: bool) {
    let info = env.stat_cache.stat(path);
    if uses_timestamp_signing(env, path, force_timestamp) {
        h.add_integer(if info.exists { info.timestamp } else { 0 });
        return;
    }
    if !info.exists {
        h.add_integer(u64::MAX);
        return;
    }
    match env.digest_cache.digest(path, info.timestamp) {
        Some(digest) => h.add_bytes(&digest.0),
        None => h.add_string("<missing>"),
    }
}

/// All implicit dependencies of a node, deduplicated across its explicit
/// inputs and ordered deterministically (by path hash, then path).  Both the
/// signature and the state persistor walk this exact sequence.
pub fn collect_implicit_deps(
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
    node: &NodeData,
) -> Vec<FileAndHash> {
    let scanner_config = match &node.scanner {
        Some(s) => s,
        None => return Vec::new(),
    };
    let mut set: BTreeSet<(u32, String)> = BTreeSet::new();
    for input in &node.input_files {
        for dep in scanner::scan_implicit_deps(stat_cache, scan_cache, scanner_config, &input.path)
        {
            set.insert((dep.path_hash, dep.path));
        }
    }
    set.into_iter()
        .map(|(path_hash, path)| FileAndHash { path, path_hash })
        .collect()
}

/// Compute a node's input signature.  Preconditions: all dependencies
/// completed successfully; the caller holds no queue lock.
pub fn compute_input_signature(env: &SignatureEnv, node: &NodeData) -> HashDigest {
    let mut h = HashState::new();

    // Action text first; if that changes we definitely rebuild.
    h.add_string(&node.action);
    h.add_separator();

    if let Some(pre_action) = &node.pre_action {
        h.add_string(pre_action);
        h.add_separator();
    }

    let force_timestamp = node.flags.ban_content_digest_for_inputs();

    // Explicit inputs in DAG order.  The frontend is trusted to emit them in
    // a stable order; reordering without a semantic change costs one false
    // rebuild.
    for input in &node.input_files {
        h.add_path(&input.path);
        add_file_signature(&mut h, env, &input.path, force_timestamp);
    }

    if node.scanner.is_some() {
        for dep in collect_implicit_deps(env.stat_cache, env.scan_cache, node) {
            h.add_path(&dep.path);
            add_file_signature(&mut h, env, &dep.path, force_timestamp);
        }
    }

    for substring in &node.allowed_output_substrings {
        h.add_string(substring);
    }

    h.add_integer(node.flags.allow_unexpected_output() as u64);
    h.add_integer(node.flags.allow_unwritten_output_files() as u64);

    h.finalize()
}

/// Outcome of the signature check: either the node must run, or it's
/// current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureDecision {
    RunAction,
    UpToDate,
}

fn output_files_differ(node: &NodeData, prior: &NodeStateRecord) -> bool {
    if node.output_files.len() != prior.output_files.len() {
        return true;
    }
    node.output_files
        .iter()
        .zip(&prior.output_files)
        .any(|(a, b)| a.path != *b)
}

fn output_files_missing<'a>(env: &SignatureEnv, node: &'a NodeData) -> Vec<&'a str> {
    node.output_files
        .iter()
        .filter(|f| !env.stat_cache.stat(&f.path).exists)
        .map(|f| f.path.as_str())
        .collect()
}

fn changed_file_record(
    env: &SignatureEnv,
    path: &str,
    last_timestamp: u64,
    dependency: &str,
    force_timestamp: bool,
) -> Option<serde_json::Value> {
    if uses_timestamp_signing(env, path, force_timestamp) {
        let timestamp = env.stat_cache.stat(path).timestamp;
        (timestamp != last_timestamp).then(|| {
            json!({
                "key": "InputFileTimestamp",
                "path": path,
                "dependency": dependency,
            })
        })
    } else {
        let info = env.stat_cache.stat(path);
        env.digest_cache
            .has_changed(path, info.timestamp)
            .then(|| {
                json!({
                    "key": "InputFileDigest",
                    "path": path,
                    "dependency": dependency,
                })
            })
    }
}

/// Explain a signature mismatch: which attribute or file moved.  Only called
/// once a mismatch is established, so the answer is best-effort diagnostics.
fn report_signature_changes(
    env: &SignatureEnv,
    node: &NodeData,
    prior: &NodeStateRecord,
) -> Vec<serde_json::Value> {
    let mut changes = Vec::new();
    let force_timestamp = node.flags.ban_content_digest_for_inputs();

    if node.action != prior.action {
        changes.push(json!({
            "key": "Action",
            "value": node.action,
            "oldvalue": prior.action,
        }));
    }

    if node.pre_action != prior.pre_action {
        changes.push(json!({
            "key": "PreAction",
            "value": node.pre_action,
            "oldvalue": prior.pre_action,
        }));
    }

    let explicit_list_changed = node.input_files.len() != prior.input_files.len()
        || node
            .input_files
            .iter()
            .zip(&prior.input_files)
            .any(|(a, b)| a.path != b.path);
    if explicit_list_changed {
        changes.push(json!({
            "key": "InputFileList",
            "value": node.input_files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            "oldvalue": prior.input_files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            "dependency": "explicit",
        }));
        // Files common to both lists may have changed too; a common cause of
        // a list change is a command change whose diff lives in response
        // files.
        for old in &prior.input_files {
            if node.input_files.iter().any(|f| f.path == old.path) {
                changes.extend(changed_file_record(
                    env,
                    &old.path,
                    old.timestamp,
                    "explicit",
                    force_timestamp,
                ));
            }
        }
        // Little point scanning implicit dependencies after a list change.
        return changes;
    }

    for old in &prior.input_files {
        changes.extend(changed_file_record(
            env,
            &old.path,
            old.timestamp,
            "explicit",
            force_timestamp,
        ));
    }

    if node.scanner.is_some() {
        let implicit = collect_implicit_deps(env.stat_cache, env.scan_cache, node);
        let implicit_list_changed = implicit.len() != prior.implicit_input_files.len()
            || prior
                .implicit_input_files
                .iter()
                .any(|old| !implicit.iter().any(|f| f.path == old.path));
        if implicit_list_changed {
            changes.push(json!({
                "key": "InputFileList",
                "value": implicit.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
                "oldvalue": prior.implicit_input_files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
                "dependency": "implicit",
            }));
            return changes;
        }
        for old in &prior.implicit_input_files {
            changes.extend(changed_file_record(
                env,
                &old.path,
                old.timestamp,
                "implicit",
                force_timestamp,
            ));
        }
    }

    changes
}

/// Compute the signature and decide whether the node needs to run, emitting
/// structured log records for each rebuild cause.
pub fn check_input_signature(
    env: &SignatureEnv,
    node: &NodeData,
    prior: Option<&NodeStateRecord>,
) -> (HashDigest, SignatureDecision) {
    let signature = compute_input_signature(env, node);

    let prior = match prior {
        None => {
            tracing::trace!(annotation = %node.annotation, "building - new node");
            if structlog::is_active() {
                structlog::write(&json!({
                    "msg": "newNode",
                    "annotation": node.annotation,
                    "index": node.original_index,
                }));
            }
            return (signature, SignatureDecision::RunAction);
        }
        Some(p) => p,
    };

    if prior.input_signature != signature {
        tracing::trace!(
            annotation = %node.annotation,
            was = %prior.input_signature.to_hex(),
            now = %signature.to_hex(),
            "building - input signature changed"
        );
        if structlog::is_active() {
            structlog::write(&json!({
                "msg": "inputSignatureChanged",
                "annotation": node.annotation,
                "index": node.original_index,
                "changes": report_signature_changes(env, node, prior),
            }));
        }
        return (signature, SignatureDecision::RunAction);
    }

    if prior.build_result != 0 {
        tracing::trace!(annotation = %node.annotation, "building - previous build failed");
        if structlog::is_active() {
            structlog::write(&json!({
                "msg": "nodeRetryBuild",
                "annotation": node.annotation,
                "index": node.original_index,
            }));
        }
        return (signature, SignatureDecision::RunAction);
    }

    if output_files_differ(node, prior) {
        tracing::trace!(annotation = %node.annotation, "building - output files have changed");
        return (signature, SignatureDecision::RunAction);
    }

    let missing = output_files_missing(env, node);
    if !missing.is_empty() {
        tracing::trace!(annotation = %node.annotation, "building - output files are missing");
        if structlog::is_active() {
            structlog::write(&json!({
                "msg": "nodeOutputsMissing",
                "annotation": node.annotation,
                "index": node.original_index,
                "files": missing,
            }));
        }
        return (signature, SignatureDecision::RunAction);
    }

    tracing::trace!(annotation = %node.annotation, "up to date");
    (signature, SignatureDecision::UpToDate)
}
