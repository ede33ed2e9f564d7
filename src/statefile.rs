//! The persisted build state: one record per node GUID from the previous
//! run, consulted to decide up-to-date-ness, and rewritten after every build
//! by merge-walking the sorted prior records against the sorted live nodes.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::graph::{DagData, Guid, NodeData};
use crate::hash::HashDigest;
use crate::nodestate::{BuildProgress, NodeState};
use crate::scancache::ScanCache;
use crate::signature;
use crate::statcache::StatCache;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimestampedFile {
    pub timestamp: u64,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStateRecord {
    pub guid: Guid,
    pub build_result: i32,
    pub input_signature: HashDigest,
    pub output_files: Vec<String>,
    pub aux_output_files: Vec<String>,
    pub action: String,
    #[serde(default)]
    pub pre_action: Option<String>,
    pub input_files: Vec<TimestampedFile>,
    pub implicit_input_files: Vec<TimestampedFile>,
    /// Hashed identifiers of every DAG this node has been seen in; drives
    /// both record retirement and stale-output sweeping.
    pub dags_seen: Vec<u32>,
}

impl NodeStateRecord {
    pub fn was_used_by_dag(&self, dag_identifier: u32) -> bool {
        self.dags_seen.contains(&dag_identifier)
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct StateData {
    pub magic: u32,
    /// Sorted ascending by guid.
    pub nodes: Vec<NodeStateRecord>,
    pub magic_end: u32,
}

impl StateData {
    pub const MAGIC: u32 = 0x6074_11b5;

    pub fn load(path: &str) -> Option<StateData> {
        let bytes = std::fs::read(path).ok()?;
        let state: StateData = serde_json::from_slice(&bytes).ok()?;
        if state.magic != Self::MAGIC || state.magic_end != Self::MAGIC {
            tracing::warn!(path, "discarding build state with bad magic");
            return None;
        }
        Some(state)
    }

    pub fn find(&self, guid: &Guid) -> Option<usize> {
        self.nodes
            .binary_search_by(|record| record.guid.cmp(guid))
            .ok()
    }
}

/// Fresh record for a node that computed a signature this run.
fn fresh_record(
    dag: &DagData,
    node: &NodeData,
    state: &NodeState,
    guid: &Guid,
    prior: Option<&NodeStateRecord>,
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
) -> NodeStateRecord {
    let input_files = node
        .input_files
        .iter()
        .map(|f| TimestampedFile {
            timestamp: stat_cache.stat(&f.path).timestamp,
            path: f.path.clone(),
        })
        .collect();

    // Re-runs the scanner, but against the already-populated scan cache, so
    // this is lookups rather than lexing.
    let implicit_input_files = signature::collect_implicit_deps(stat_cache, scan_cache, node)
        .into_iter()
        .map(|f| TimestampedFile {
            timestamp: stat_cache.stat(&f.path).timestamp,
            path: f.path,
        })
        .collect();

    let mut dags_seen: Vec<u32> = prior.map(|p| p.dags_seen.clone()).unwrap_or_default();
    if !dags_seen.contains(&dag.hashed_identifier) {
        dags_seen.push(dag.hashed_identifier);
    }

    NodeStateRecord {
        guid: *guid,
        build_result: state.build_result,
        input_signature: state.input_signature,
        output_files: node.output_files.iter().map(|f| f.path.clone()).collect(),
        aux_output_files: node
            .aux_output_files
            .iter()
            .map(|f| f.path.clone())
            .collect(),
        action: node.action.clone(),
        pre_action: node.pre_action.clone(),
        input_files,
        implicit_input_files,
        dags_seen,
    }
}

/// Merge-walk the live nodes against the prior records and produce the next
/// state file's contents.
pub fn build_state_records(
    dag: &DagData,
    prior: Option<&StateData>,
    live: &[NodeState],
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
) -> Vec<NodeStateRecord> {
    // Live nodes, ordered by guid.  The DAG is guid-sorted, so sorting by
    // frozen index is the same order.
    let mut live_sorted: Vec<&NodeState> = live.iter().collect();
    live_sorted.sort_by_key(|s| s.dag_index.0);

    let empty: &[NodeStateRecord] = &[];
    let old = prior.map(|p| p.nodes.as_slice()).unwrap_or(empty);

    let mut out = Vec::with_capacity(live_sorted.len() + old.len());

    let save_live = |out: &mut Vec<NodeStateRecord>, state: &NodeState| {
        let node = dag.node(state.dag_index);
        let guid = dag.guid(state.dag_index);
        let prior_record = state.prior.map(|idx| &old[idx]);
        if state.progress < BuildProgress::Unblocked {
            // Never computed a signature this run (interrupted, or an error
            // upstream).  Preserve the prior record verbatim to retain
            // history; a node with no history simply isn't recorded.
            if let Some(record) = prior_record {
                out.push(record.clone());
            }
        } else {
            out.push(fresh_record(
                dag,
                node,
                state,
                guid,
                prior_record,
                stat_cache,
                scan_cache,
            ));
        }
    };

    let save_old = |out: &mut Vec<NodeStateRecord>, record: &NodeStateRecord| {
        // Keep the record unless the DAG no longer references the node and
        // the record was only relevant to this same DAG.
        let in_dag = dag.node_guids.binary_search(&record.guid).is_ok();
        if in_dag || !record.was_used_by_dag(dag.hashed_identifier) {
            out.push(record.clone());
        } else {
            tracing::debug!(guid = %record.guid.to_hex(), "dropping retired node record");
        }
    };

    let mut i = 0;
    let mut j = 0;
    while i < live_sorted.len() || j < old.len() {
        if j == old.len() {
            save_live(&mut out, live_sorted[i]);
            i += 1;
        } else if i == live_sorted.len() {
            save_old(&mut out, &old[j]);
            j += 1;
        } else {
            let live_guid = dag.guid(live_sorted[i].dag_index);
            match live_guid.cmp(&old[j].guid) {
                std::cmp::Ordering::Less => {
                    save_live(&mut out, live_sorted[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    save_old(&mut out, &old[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    save_live(&mut out, live_sorted[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
    }
    out
}

/// Write the post-build state, atomically via temp + rename.
pub fn save_build_state(
    dag: &DagData,
    prior: Option<&StateData>,
    live: &[NodeState],
    stat_cache: &StatCache,
    scan_cache: &ScanCache,
) -> anyhow::Result<()> {
    let state = StateData {
        magic: StateData::MAGIC,
        nodes: build_state_records(dag, prior, live, stat_cache, scan_cache),
        magic_end: StateData::MAGIC,
    };

    let write_tmp = || -> anyhow::Result<()> {
        let mut f = std::fs::File::create(&dag.state_filename_tmp)?;
        f.write_all(&serde_json::to_vec(&state)?)?;
        f.flush()?;
        Ok(())
    };
    if let Err(err) = write_tmp() {
        let _ = std::fs::remove_file(&dag.state_filename_tmp);
        return Err(err);
    }
    if let Err(err) = std::fs::rename(&dag.state_filename_tmp, &dag.state_filename) {
        let _ = std::fs::remove_file(&dag.state_filename_tmp);
        return Err(err.into());
    }
    Ok(())
}
