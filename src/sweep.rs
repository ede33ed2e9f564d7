//! Stale output reclamation: delete files the previous DAG produced that the
//! current DAG no longer does, then their emptied parent directories.

use std::collections::HashSet;
use std::time::Instant;

use crate::fs;
use crate::graph::DagData;
use crate::printing;
use crate::statefile::StateData;

fn schedule_with_ancestors(nuke: &mut HashSet<String>, path: &str) {
    nuke.insert(path.to_string());
    let mut dir = path;
    while let Some(idx) = dir.rfind(['/', '\\']) {
        dir = &dir[..idx];
        if dir.is_empty() || dir.ends_with(':') {
            break;
        }
        nuke.insert(dir.to_string());
    }
}

/// Diff prior outputs against current DAG outputs and remove what's no
/// longer produced.  Directory removals silently fail on non-empty, which is
/// the desired policy: only emptied directories disappear.  Returns how many
/// paths were actually removed.
pub fn remove_stale_outputs(dag: &DagData, prior: Option<&StateData>) -> usize {
    let state = match prior {
        Some(state) => state,
        None => {
            tracing::debug!("unable to clean up stale output files - no previous build state");
            return 0;
        }
    };

    let mut produced: HashSet<&str> = HashSet::new();
    for node in &dag.nodes {
        for f in node.output_files.iter().chain(&node.aux_output_files) {
            produced.insert(f.path.as_str());
        }
    }

    let mut nuke: HashSet<String> = HashSet::new();
    for record in &state.nodes {
        // Only trust records that were produced under this same DAG; other
        // DAGs sharing the state file own their outputs.
        if !record.was_used_by_dag(dag.hashed_identifier) {
            continue;
        }
        for path in record.output_files.iter().chain(&record.aux_output_files) {
            if !produced.contains(path.as_str()) {
                schedule_with_ancestors(&mut nuke, path);
            }
        }
    }

    // Longest paths first, so files and subdirectories go before their
    // parent directories.
    let mut paths: Vec<&String> = nuke.iter().collect();
    paths.sort_by(|l, r| r.len().cmp(&l.len()).then_with(|| l.cmp(r)));

    let started = Instant::now();
    let mut removed = 0;
    for path in &paths {
        tracing::debug!(path = %path, "cleaning up");
        if fs::remove_file_or_dir(path).is_ok() {
            removed += 1;
        }
    }

    if removed > 0 {
        printing::print_non_node_action_result(
            &format!(
                "Delete {} artifact files that are no longer in use. (like {})",
                removed, paths[0]
            ),
            started.elapsed(),
            true,
            &[],
        );
    }
    removed
}
