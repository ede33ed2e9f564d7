//! Per-node runtime state: where a node is in its life cycle, plus the
//! queued/active/blocked aspects that the queue tracks separately from
//! progress (a node can be blocked but not queued, or queued but not yet
//! picked up by a worker).

use crate::densemap;
use crate::graph::NodeId;
use crate::hash::HashDigest;

/// Index into the live node-state array (sorted by pass), as opposed to
/// `NodeId` which indexes the frozen DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub usize);

impl densemap::Index for StateId {
    fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for StateId {
    fn from(u: usize) -> StateId {
        StateId(u)
    }
}

/// Progress through the build state machine.  The ordering is meaningful:
/// the state persistor treats anything below Unblocked as "never got to a
/// signature", and the action runner compares against RunAction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildProgress {
    Initial,
    Blocked,
    Unblocked,
    CheckSignature,
    RunAction,
    UpToDate,
    Succeeded,
    Failed,
    Completed,
}

pub struct NodeState {
    pub progress: BuildProgress,
    pub queued: bool,
    pub active: bool,
    pub blocked: bool,
    /// Computed during CheckSignature; zero until then.
    pub input_signature: HashDigest,
    /// 0 on success, nonzero on failure.  Meaningful once Completed.
    pub build_result: i32,
    /// The frozen node this state shadows.
    pub dag_index: NodeId,
    /// Index into the prior state's record array, when this GUID was seen
    /// before.
    pub prior: Option<usize>,
    /// Denormalized from the frozen node for pass sorting.
    pub pass_index: u32,
}

impl NodeState {
    pub fn new(dag_index: NodeId, pass_index: u32) -> NodeState {
        NodeState {
            progress: BuildProgress::Initial,
            queued: false,
            active: false,
            blocked: false,
            input_signature: HashDigest::default(),
            build_result: 0,
            dag_index,
            prior: None,
            pass_index,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.progress == BuildProgress::Completed
    }

    pub fn completed_ok(&self) -> bool {
        self.is_completed() && self.build_result == 0
    }
}
