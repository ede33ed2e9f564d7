//! Loads the frozen DAG and everything that rides along with it (prior build
//! state, digest and scan caches), validates that the DAG still matches the
//! filesystem it was generated against, and prepares the live node-state
//! array the build queue runs over.

use std::sync::Arc;

use anyhow::{anyhow, bail};

use crate::densemap::DenseMap;
use crate::digestcache::DigestCache;
use crate::fs;
use crate::graph::{DagData, DagGlobSignature, NodeId};
use crate::hash::{djb2_hash_path, HashDigest, HashState};
use crate::nodestate::NodeState;
use crate::scancache::ScanCache;
use crate::statcache::StatCache;
use crate::statefile::StateData;

/// One pass worth of contiguous node-state indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassRange {
    pub pass_index: u32,
    pub start: usize,
    pub count: usize,
}

pub struct LoadedBuild {
    pub dag: Arc<DagData>,
    pub prior_state: Option<Arc<StateData>>,
    pub stat_cache: Arc<StatCache>,
    pub digest_cache: Arc<DigestCache>,
    pub scan_cache: Arc<ScanCache>,
    /// Selected nodes, sorted by pass index.
    pub node_states: Vec<NodeState>,
    /// DAG index -> node_states index, -1 for unselected nodes.
    pub remap: DenseMap<NodeId, i32>,
    pub pass_ranges: Vec<PassRange>,
}

/// Minimal wildcard match: `*` spans anything, `?` one character.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    // dp over pattern x name positions; both are short (filenames).
    let mut reachable = vec![false; p.len() + 1];
    reachable[0] = true;
    for i in 0..p.len() {
        if p[i] == '*' && reachable[i] {
            reachable[i + 1] = true;
        }
    }
    for &c in &n {
        let mut next = vec![false; p.len() + 1];
        for i in 0..p.len() {
            if !reachable[i] {
                continue;
            }
            match p[i] {
                '*' => {
                    next[i] = true;
                    next[i + 1] = true;
                }
                '?' => next[i + 1] = true,
                pc if pc == c => next[i + 1] = true,
                _ => {}
            }
        }
        for i in 0..p.len() {
            if next[i] && p[i] == '*' {
                next[i + 1] = true;
            }
        }
        reachable = next;
    }
    reachable[p.len()]
}

/// Digest of a directory listing, matching what the frontend recorded: the
/// path's existence and kind, then sorted directories, a separator, and
/// sorted (filtered) files.
pub fn compute_glob_signature(path: &str, filter: Option<&str>, recurse: bool) -> HashDigest {
    let mut h = HashState::new();
    let meta = std::fs::metadata(path).ok();
    let exists = meta.is_some();
    let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
    h.add_integer(exists as u64);
    h.add_integer(is_dir as u64);
    h.add_separator();

    if is_dir {
        let mut dirs: Vec<String> = Vec::new();
        let mut files: Vec<String> = Vec::new();
        let max_depth = if recurse { usize::MAX } else { 1 };
        for entry in walkdir::WalkDir::new(path)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .flatten()
        {
            let entry_path = entry.path().to_string_lossy().into_owned();
            if entry.file_type().is_dir() {
                dirs.push(entry_path);
            } else {
                let matches = match filter {
                    Some(f) => wildcard_match(f, &entry.file_name().to_string_lossy()),
                    None => true,
                };
                if matches {
                    files.push(entry_path);
                }
            }
        }
        dirs.sort();
        files.sort();
        for d in &dirs {
            h.add_path(d);
            h.add_separator();
        }
        // Extra separator to catch a directory that turned into a file.
        h.add_separator();
        for f in &files {
            h.add_path(f);
            h.add_separator();
        }
    } else if exists {
        h.add_integer(fs::stat(path).timestamp);
    }

    h.finalize()
}

fn validate_glob_signature(glob: &DagGlobSignature) -> bool {
    compute_glob_signature(&glob.path, glob.filter.as_deref(), glob.recurse) == glob.digest
}

/// Check that the filesystem still looks the way it did when the frontend
/// generated this DAG.  A mismatch means the frontend must re-run; building
/// against a stale graph produces wrong answers quietly.
pub fn validate_dag_signatures(dag: &DagData) -> anyhow::Result<()> {
    for sig in &dag.file_signatures {
        let info = fs::stat(&sig.path);
        if info.timestamp != sig.timestamp {
            bail!(
                "DAG is out of date: {} changed since the DAG was generated",
                sig.path
            );
        }
    }
    for glob in &dag.glob_signatures {
        if !validate_glob_signature(glob) {
            bail!(
                "DAG is out of date: directory contents of {} changed since the DAG was generated",
                glob.path
            );
        }
    }
    Ok(())
}

fn parse_dag(bytes: &[u8]) -> anyhow::Result<DagData> {
    let mut dag: DagData =
        serde_json::from_slice(bytes).map_err(|err| anyhow!("parse DAG: {}", err))?;
    if dag.magic != DagData::MAGIC || dag.magic_end != DagData::MAGIC {
        bail!("DAG magic number mismatch (corrupt or truncated file)");
    }
    if dag.node_guids.len() != dag.nodes.len() {
        bail!(
            "DAG guid table ({}) does not match node table ({})",
            dag.node_guids.len(),
            dag.nodes.len()
        );
    }
    // Fill in any path hashes the producer left at zero.
    for node in &mut dag.nodes {
        for f in node
            .input_files
            .iter_mut()
            .chain(&mut node.output_files)
            .chain(&mut node.aux_output_files)
        {
            if f.path_hash == 0 {
                f.path_hash = djb2_hash_path(&f.path);
            }
        }
    }
    Ok(dag)
}

/// Resolve requested targets to DAG node indices.  A target names a node by
/// annotation or by one of its output paths; no targets selects everything.
fn select_roots(dag: &DagData, targets: &[String]) -> anyhow::Result<Vec<usize>> {
    if targets.is_empty() {
        return Ok((0..dag.node_count()).collect());
    }
    let mut roots = Vec::new();
    for target in targets {
        let found = dag.nodes.iter().enumerate().find(|(_, node)| {
            node.annotation == *target || node.output_files.iter().any(|f| f.path == *target)
        });
        match found {
            Some((index, _)) => roots.push(index),
            None => bail!("unknown target {:?}", target),
        }
    }
    Ok(roots)
}

/// Build the live node-state array: the reachable subset of the DAG from the
/// selected roots, sorted by pass, plus the remap table from DAG indices.
pub fn prepare_node_states(
    dag: &DagData,
    prior: Option<&StateData>,
    targets: &[String],
) -> anyhow::Result<(Vec<NodeState>, DenseMap<NodeId, i32>, Vec<PassRange>)> {
    let roots = select_roots(dag, targets)?;

    // Depth-first reachability over dependencies.
    let mut visited = vec![false; dag.node_count()];
    let mut stack = roots;
    let mut selected = Vec::new();
    while let Some(index) = stack.pop() {
        if visited[index] {
            continue;
        }
        visited[index] = true;
        selected.push(index);
        let node = &dag.nodes[index];
        if (node.pass_index as usize) >= dag.passes.len().max(1) {
            bail!(
                "node {:?} references pass {} but the DAG has {} passes",
                node.annotation,
                node.pass_index,
                dag.passes.len()
            );
        }
        for &dep in &node.dependencies {
            stack.push(dep as usize);
        }
    }

    let mut node_states: Vec<NodeState> = selected
        .iter()
        .map(|&index| {
            let mut state = NodeState::new(NodeId(index), dag.nodes[index].pass_index);
            state.prior = prior.and_then(|p| p.find(dag.guid(NodeId(index))));
            state
        })
        .collect();

    // Sort by pass; the queue builds one contiguous pass range at a time.
    node_states.sort_by_key(|s| (s.pass_index, s.dag_index.0));

    let mut remap = DenseMap::new_sized(NodeId(dag.node_count()), -1i32);
    for (state_index, state) in node_states.iter().enumerate() {
        *remap.get_mut(state.dag_index) = state_index as i32;
    }

    let mut pass_ranges: Vec<PassRange> = Vec::new();
    for (index, state) in node_states.iter().enumerate() {
        match pass_ranges.last_mut() {
            Some(range) if range.pass_index == state.pass_index => range.count += 1,
            _ => pass_ranges.push(PassRange {
                pass_index: state.pass_index,
                start: index,
                count: 1,
            }),
        }
    }

    tracing::debug!(
        dag_nodes = dag.node_count(),
        live_nodes = node_states.len(),
        passes = pass_ranges.len(),
        "node states prepared"
    );

    Ok((node_states, remap, pass_ranges))
}

/// Load everything a build needs from the DAG file onward.
pub fn read(dag_path: &str, targets: &[String]) -> anyhow::Result<LoadedBuild> {
    let bytes =
        std::fs::read(dag_path).map_err(|err| anyhow!("read {}: {}", dag_path, err))?;
    let dag = parse_dag(&bytes)?;
    validate_dag_signatures(&dag)?;

    let prior_state = StateData::load(&dag.state_filename).map(Arc::new);
    let digest_cache = Arc::new(DigestCache::load(&dag.digest_cache_filename));
    let scan_cache = Arc::new(ScanCache::load(&dag.scan_cache_filename));

    let (node_states, remap, pass_ranges) =
        prepare_node_states(&dag, prior_state.as_deref(), targets)?;

    Ok(LoadedBuild {
        dag: Arc::new(dag),
        prior_state,
        stat_cache: Arc::new(StatCache::new()),
        digest_cache,
        scan_cache,
        node_states,
        remap,
        pass_ranges,
    })
}
