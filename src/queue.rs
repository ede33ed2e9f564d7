//! The build queue: a fixed worker pool advancing nodes through their state
//! machine, fed by a mutex-guarded ring buffer of ready node indices.
//!
//! The locking policy: one worker at a time holds the queue lock while it
//! figures out what to do next; the lock is released around anything slow
//! (signature hashing, process execution) and re-acquired before touching
//! queue state again.  In a sense it's a single-threaded system, except that
//! it happens on multiple threads.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::action;
use crate::densemap::DenseMap;
use crate::digestcache::DigestCache;
use crate::graph::{DagData, NodeId};
use crate::nodestate::{BuildProgress, NodeState, StateId};
use crate::printing::Printer;
use crate::resources::SharedResources;
use crate::scancache::ScanCache;
use crate::signal;
use crate::signature::{self, SignatureDecision, SignatureEnv};
use crate::statcache::StatCache;
use crate::statefile::StateData;
use crate::throttle::{ActivityThrottler, NoActivityDetection, OsActivity};

pub const MAX_BUILD_THREADS: usize = 64;

/// How long the main thread sleeps between checks for an externally raised
/// interrupt while waiting for the build to finish.
const FINISHED_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    Ok,
    Interrupted,
    BuildError,
    SetupError,
}

impl BuildResult {
    pub fn exit_code(self) -> i32 {
        match self {
            BuildResult::Ok => 0,
            BuildResult::Interrupted => 1,
            BuildResult::BuildError => 2,
            BuildResult::SetupError => 3,
        }
    }
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuildResult::Ok => "build success",
            BuildResult::Interrupted => "build interrupted",
            BuildResult::BuildError => "build failed",
            BuildResult::SetupError => "build failed to setup",
        };
        f.write_str(name)
    }
}

fn next_pow2(mut n: u32) -> u32 {
    n = n.max(1);
    n.next_power_of_two()
}

/// Single-producer/multi-consumer bounded ring of ready node indices.
/// Power-of-two capacity; read == write means empty.  Intentionally not
/// lock-free: it lives under the queue mutex, which is almost always
/// uncontended.
struct RingQueue {
    buf: Vec<StateId>,
    read: u32,
    write: u32,
    mask: u32,
}

impl RingQueue {
    fn with_capacity_for(max_nodes: usize) -> RingQueue {
        let capacity = next_pow2(max_nodes as u32 + 1);
        RingQueue {
            buf: vec![StateId(0); capacity as usize],
            read: 0,
            write: 0,
            mask: capacity - 1,
        }
    }

    fn len(&self) -> usize {
        (self.write.wrapping_sub(self.read) & self.mask) as usize
    }

    fn push(&mut self, id: StateId) {
        debug_assert!(self.len() < self.mask as usize);
        self.buf[(self.write & self.mask) as usize] = id;
        self.write = self.write.wrapping_add(1) & self.mask;
    }

    fn pop(&mut self) -> Option<StateId> {
        if self.read == self.write {
            return None;
        }
        let id = self.buf[(self.read & self.mask) as usize];
        self.read = self.read.wrapping_add(1) & self.mask;
        Some(id)
    }
}

#[derive(Clone)]
pub struct QueueOptions {
    pub thread_count: usize,
    pub echo_cmdline: bool,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub max_expensive_count: usize,
    pub throttle_on_human_activity: bool,
    pub throttle_inactivity_period: u32,
    pub throttled_threads_amount: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            thread_count: 1,
            echo_cmdline: false,
            continue_on_error: false,
            dry_run: false,
            max_expensive_count: 1,
            throttle_on_human_activity: false,
            throttle_inactivity_period: 30,
            throttled_threads_amount: 0,
        }
    }
}

pub struct BuildQueueConfig {
    pub dag: Arc<DagData>,
    pub prior_state: Option<Arc<StateData>>,
    pub stat_cache: Arc<StatCache>,
    pub digest_cache: Arc<DigestCache>,
    pub scan_cache: Arc<ScanCache>,
    /// Live nodes, sorted by pass index.
    pub node_states: Vec<NodeState>,
    /// DAG index -> live state index, -1 when the node isn't selected.
    pub remap: DenseMap<NodeId, i32>,
    pub options: QueueOptions,
}

/// Mutable queue state; everything in here is guarded by the queue mutex.
pub(crate) struct QueueState {
    ring: RingQueue,
    pub(crate) nodes: DenseMap<StateId, NodeState>,
    /// Parked expensive nodes, unparked LIFO.
    expensive_wait: Vec<StateId>,
    pub(crate) expensive_running: usize,
    pending_count: usize,
    failed_count: usize,
    pub(crate) processed_count: usize,
    current_pass: u32,
    dynamic_max_jobs: u32,
    main_wants_cleanup: bool,
    pub(crate) printer: Printer,
}

impl QueueState {
    fn should_keep_building(&self) -> bool {
        // You'd think the failed-count check is redundant with the main
        // thread tearing the build down, but without it workers would keep
        // starting nodes whose siblings have already failed.
        !self.main_wants_cleanup && self.failed_count == 0
    }

    fn next_node(&mut self) -> Option<StateId> {
        let id = self.ring.pop()?;
        let node = self.nodes.get_mut(id);
        debug_assert!(node.queued);
        debug_assert!(!node.active);
        node.queued = false;
        node.active = true;
        Some(id)
    }
}

pub(crate) struct QueueShared {
    pub(crate) lock: Mutex<QueueState>,
    pub(crate) work_available: Condvar,
    max_jobs_changed: Condvar,
    finished_lock: Mutex<bool>,
    finished_cond: Condvar,

    pub(crate) dag: Arc<DagData>,
    prior_state: Option<Arc<StateData>>,
    pub(crate) stat_cache: Arc<StatCache>,
    pub(crate) digest_cache: Arc<DigestCache>,
    pub(crate) scan_cache: Arc<ScanCache>,
    pub(crate) resources: SharedResources,
    remap: DenseMap<NodeId, i32>,
    pub(crate) options: QueueOptions,
}

impl QueueShared {
    pub(crate) fn state_for_node(&self, dag_index: NodeId) -> Option<StateId> {
        let state_index = *self.remap.get(dag_index);
        if state_index < 0 {
            None
        } else {
            Some(StateId(state_index as usize))
        }
    }

    pub(crate) fn signal_build_finished(&self) {
        let mut finished = self.finished_lock.lock().unwrap();
        *finished = true;
        self.finished_cond.notify_one();
    }
}

fn all_dependencies_ready(shared: &QueueShared, state: &QueueState, id: StateId) -> bool {
    let node = shared.dag.node(state.nodes.get(id).dag_index);
    node.dependencies.iter().all(|&dep| {
        let dep_id = shared
            .state_for_node(NodeId(dep as usize))
            .expect("dependency outside selected node set");
        state.nodes.get(dep_id).is_completed()
    })
}

fn enqueue(shared: &QueueShared, state: &mut QueueState, id: StateId) {
    {
        let node = state.nodes.get(id);
        debug_assert!(!node.queued);
        debug_assert!(!node.active);
        debug_assert!(!node.is_completed());
        debug_assert_eq!(node.pass_index, state.current_pass);
    }
    debug_assert!(all_dependencies_ready(shared, state, id));
    state.ring.push(id);
    state.nodes.get_mut(id).queued = true;
}

fn wake_waiters(shared: &QueueShared, count: usize) {
    if count > 1 {
        shared.work_available.notify_all();
    } else if count == 1 {
        shared.work_available.notify_one();
    }
}

/// Park an expensive node that lost the admission race; it stays in
/// RunAction and is re-queued when a slot frees up.
pub(crate) fn park_expensive_node(state: &mut QueueState, id: StateId) {
    state.nodes.get_mut(id).queued = true;
    state.expensive_wait.push(id);
}

pub(crate) fn unpark_expensive_node(shared: &QueueShared, state: &mut QueueState) {
    if let Some(id) = state.expensive_wait.pop() {
        debug_assert!(state.nodes.get(id).queued);
        // Clear the park bookkeeping so enqueue's own checks hold.
        let node = state.nodes.get_mut(id);
        node.queued = false;
        node.active = false;
        enqueue(shared, state, id);
        shared.work_available.notify_one();
    }
}

/// Count unfinished dependencies and kick off any that aren't moving yet.
fn setup_dependencies(shared: &QueueShared, state: &mut QueueState, id: StateId) -> BuildProgress {
    let deps = shared
        .dag
        .node(state.nodes.get(id).dag_index)
        .dependencies
        .clone();

    let mut dep_waits_needed = 0;
    let mut enqueue_count = 0;
    for dep in deps {
        let dep_id = shared
            .state_for_node(NodeId(dep as usize))
            .expect("dependency outside selected node set");
        let dep_state = state.nodes.get(dep_id);
        debug_assert!(dep_state.pass_index <= state.nodes.get(id).pass_index);

        if dep_state.is_completed() {
            continue;
        }
        dep_waits_needed += 1;

        if !dep_state.queued && !dep_state.active && !dep_state.blocked {
            enqueue(shared, state, dep_id);
            enqueue_count += 1;
        }
    }

    wake_waiters(shared, enqueue_count);

    if dep_waits_needed > 0 {
        BuildProgress::Blocked
    } else {
        BuildProgress::Unblocked
    }
}

/// A dependency failed somewhere below this node: it will never become
/// ready.  (Callers only consult this when a failure has been recorded.)
fn any_dependency_failed(shared: &QueueShared, state: &QueueState, id: StateId) -> bool {
    let node = shared.dag.node(state.nodes.get(id).dag_index);
    node.dependencies.iter().any(|&dep| {
        let dep_id = shared
            .state_for_node(NodeId(dep as usize))
            .expect("dependency outside selected node set");
        let dep_state = state.nodes.get(dep_id);
        dep_state.is_completed() && dep_state.build_result != 0
    })
}

fn check_input_signature<'a>(
    shared: &'a QueueShared,
    guard: MutexGuard<'a, QueueState>,
    id: StateId,
) -> (MutexGuard<'a, QueueState>, BuildProgress) {
    let (dag_index, prior_index) = {
        let node = guard.nodes.get(id);
        (node.dag_index, node.prior)
    };
    drop(guard);

    let node_data = shared.dag.node(dag_index);
    let prior_record = match (&shared.prior_state, prior_index) {
        (Some(state), Some(idx)) => Some(&state.nodes[idx]),
        _ => None,
    };
    let env = SignatureEnv {
        stat_cache: &shared.stat_cache,
        digest_cache: &shared.digest_cache,
        scan_cache: &shared.scan_cache,
        content_digest_extensions: &shared.dag.content_digest_extensions,
    };
    let (sig, decision) = signature::check_input_signature(&env, node_data, prior_record);

    let mut guard = shared.lock.lock().unwrap();
    guard.nodes.get_mut(id).input_signature = sig;
    match decision {
        SignatureDecision::UpToDate => {
            guard.processed_count += 1;
            (guard, BuildProgress::UpToDate)
        }
        SignatureDecision::RunAction => (guard, BuildProgress::RunAction),
    }
}

/// When a node completes, enqueue any of its dependents that became ready.
fn unblock_waiters(shared: &QueueShared, state: &mut QueueState, id: StateId) {
    let back_links = shared
        .dag
        .node(state.nodes.get(id).dag_index)
        .back_links
        .clone();

    let mut enqueue_count = 0;
    for link in back_links {
        let waiter_id = match shared.state_for_node(NodeId(link as usize)) {
            Some(waiter) => waiter,
            None => continue,
        };
        // Only wake nodes in the current pass.
        if state.nodes.get(waiter_id).pass_index != state.current_pass {
            continue;
        }
        if !all_dependencies_ready(shared, state, waiter_id) {
            continue;
        }
        // Did someone else get to the node first?
        let waiter = state.nodes.get(waiter_id);
        if waiter.queued || waiter.active || waiter.is_completed() {
            continue;
        }
        state.nodes.get_mut(waiter_id).blocked = false;
        enqueue(shared, state, waiter_id);
        enqueue_count += 1;
    }

    wake_waiters(shared, enqueue_count);
}

fn advance_node<'a>(
    shared: &'a QueueShared,
    mut guard: MutexGuard<'a, QueueState>,
    id: StateId,
    thread_index: usize,
) -> MutexGuard<'a, QueueState> {
    debug_assert!(!guard.nodes.get(id).is_completed());
    debug_assert!(guard.nodes.get(id).active);
    debug_assert!(!guard.nodes.get(id).queued);

    loop {
        let progress = guard.nodes.get(id).progress;
        tracing::trace!(
            thread_index,
            ?progress,
            annotation = %shared.dag.node(guard.nodes.get(id).dag_index).annotation,
            "advancing"
        );
        match progress {
            BuildProgress::Initial => {
                let next = setup_dependencies(shared, &mut guard, id);
                guard.nodes.get_mut(id).progress = next;
                if next == BuildProgress::Blocked {
                    // Inactive until our dependencies are ready.
                    let node = guard.nodes.get_mut(id);
                    node.active = false;
                    node.blocked = true;
                    return guard;
                }
            }
            BuildProgress::Blocked => {
                debug_assert!(all_dependencies_ready(shared, &guard, id));
                guard.nodes.get_mut(id).blocked = false;
                guard.nodes.get_mut(id).progress = if any_dependency_failed(shared, &guard, id) {
                    // Shouldn't normally be reached (a failure stops the
                    // queue before dependents run), but guards the
                    // continue-after-failure window.
                    BuildProgress::Failed
                } else {
                    BuildProgress::Unblocked
                };
            }
            BuildProgress::Unblocked => {
                guard.nodes.get_mut(id).progress = BuildProgress::CheckSignature;
            }
            BuildProgress::CheckSignature => {
                let (g, next) = check_input_signature(shared, guard, id);
                guard = g;
                guard.nodes.get_mut(id).progress = next;
            }
            BuildProgress::RunAction => {
                let (g, outcome) = action::run_action(shared, guard, id);
                guard = g;
                guard.nodes.get_mut(id).progress = outcome.next;

                // If we couldn't make progress, we're a parked expensive
                // node; another expensive job re-queues us when it finishes.
                if outcome.next == BuildProgress::RunAction {
                    return guard;
                }

                if outcome.counted_expensive {
                    guard.expensive_running -= 1;
                    unpark_expensive_node(shared, &mut guard);
                }
            }
            BuildProgress::UpToDate | BuildProgress::Succeeded => {
                let node = guard.nodes.get_mut(id);
                node.build_result = 0;
                node.progress = BuildProgress::Completed;
            }
            BuildProgress::Failed => {
                guard.failed_count += 1;
                let node = guard.nodes.get_mut(id);
                node.build_result = 1;
                node.progress = BuildProgress::Completed;
                shared.signal_build_finished();
            }
            BuildProgress::Completed => {
                guard.pending_count -= 1;
                guard.nodes.get_mut(id).active = false;

                unblock_waiters(shared, &mut guard, id);

                if guard.pending_count == 0 {
                    shared.signal_build_finished();
                }
                return guard;
            }
        }
    }
}

fn build_loop(shared: &QueueShared, thread_index: usize) {
    signal::block_on_current_thread();

    let mut state = shared.lock.lock().unwrap();
    while state.should_keep_building() {
        // Dynamic max-jobs shrank below us: hibernate until it changes.
        if (thread_index as u32) >= state.dynamic_max_jobs {
            state = shared.max_jobs_changed.wait(state).unwrap();
            continue;
        }

        if let Some(id) = state.next_node() {
            state = advance_node(shared, state, id, thread_index);
            continue;
        }

        // Nothing to do at this very moment.
        state = shared.work_available.wait(state).unwrap();
    }
    drop(state);
    tracing::trace!(thread_index, "build thread exiting");
}

/// Final accounting handed back to the driver once the queue is torn down.
pub struct BuildSummary {
    pub node_states: Vec<NodeState>,
    pub processed_node_count: usize,
    pub failed_node_count: usize,
}

pub struct BuildQueue {
    shared: Arc<QueueShared>,
    threads: Vec<JoinHandle<()>>,
    throttler: Option<ActivityThrottler>,
    activity: Box<dyn OsActivity>,
}

impl BuildQueue {
    pub fn new(config: BuildQueueConfig) -> BuildQueue {
        BuildQueue::with_activity(config, Box::new(NoActivityDetection))
    }

    pub fn with_activity(config: BuildQueueConfig, activity: Box<dyn OsActivity>) -> BuildQueue {
        let mut options = config.options;
        if options.thread_count > MAX_BUILD_THREADS {
            tracing::warn!(
                requested = options.thread_count,
                clamped = MAX_BUILD_THREADS,
                "too many build threads - clamping"
            );
            options.thread_count = MAX_BUILD_THREADS;
        }
        options.thread_count = options.thread_count.max(1);
        options.max_expensive_count = options
            .max_expensive_count
            .clamp(1, options.thread_count);

        let node_count = config.node_states.len();
        let mut nodes = DenseMap::new();
        for state in config.node_states {
            nodes.push(state);
        }

        let printer = Printer::new(node_count, options.echo_cmdline, options.continue_on_error);
        let state = QueueState {
            ring: RingQueue::with_capacity_for(node_count),
            nodes,
            expensive_wait: Vec::new(),
            expensive_running: 0,
            pending_count: 0,
            failed_count: 0,
            processed_count: 0,
            current_pass: 0,
            dynamic_max_jobs: options.thread_count as u32,
            main_wants_cleanup: false,
            printer,
        };

        let throttler = options.throttle_on_human_activity.then(|| {
            ActivityThrottler::new(
                options.throttle_inactivity_period,
                options.throttled_threads_amount,
                options.thread_count as u32,
            )
        });

        let resources = SharedResources::new(&config.dag.shared_resources);
        let shared = Arc::new(QueueShared {
            lock: Mutex::new(state),
            work_available: Condvar::new(),
            max_jobs_changed: Condvar::new(),
            finished_lock: Mutex::new(false),
            finished_cond: Condvar::new(),
            dag: config.dag,
            prior_state: config.prior_state,
            stat_cache: config.stat_cache,
            digest_cache: config.digest_cache,
            scan_cache: config.scan_cache,
            resources,
            remap: config.remap,
            options: options.clone(),
        });

        // A fresh queue is a fresh build session.
        signal::reset();
        // The handler must be installed before workers exist so interrupts
        // route to the main thread from the first action onward.
        signal::install_handlers();

        let threads = (0..options.thread_count)
            .map(|thread_index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("build-{}", thread_index))
                    .spawn(move || build_loop(&shared, thread_index))
                    .expect("spawn build thread")
            })
            .collect();

        tracing::debug!(threads = options.thread_count, "build queue initialized");

        BuildQueue {
            shared,
            threads,
            throttler,
            activity,
        }
    }

    /// Build the node-state range [start, start+count), which the driver has
    /// arranged to be exactly one pass.  Blocks until the pass completes,
    /// fails, or an external interrupt arrives.
    pub fn build_node_range(&mut self, start: usize, count: usize, pass_index: u32) -> BuildResult {
        if count == 0 {
            return BuildResult::Ok;
        }

        *self.shared.finished_lock.lock().unwrap() = false;

        {
            let mut state = self.shared.lock.lock().unwrap();
            debug_assert!(start + count <= state.nodes.len());
            state.current_pass = pass_index;
            state.pending_count = count;
            state.failed_count = 0;
            for i in start..start + count {
                let id = StateId(i);
                debug_assert_eq!(state.nodes.get(id).progress, BuildProgress::Initial);
                state.ring.push(id);
                state.nodes.get_mut(id).queued = true;
            }
            self.shared.work_available.notify_all();
        }

        loop {
            {
                let finished = self.shared.finished_lock.lock().unwrap();
                if *finished || signal::get_reason().is_some() {
                    break;
                }
                let (finished, _) = self
                    .shared
                    .finished_cond
                    .wait_timeout(finished, FINISHED_POLL_INTERVAL)
                    .unwrap();
                if *finished || signal::get_reason().is_some() {
                    break;
                }
            }
            self.pump_throttle();
        }

        if signal::get_reason().is_some() {
            BuildResult::Interrupted
        } else if self.shared.lock.lock().unwrap().failed_count > 0 {
            BuildResult::BuildError
        } else {
            BuildResult::Ok
        }
    }

    fn pump_throttle(&mut self) {
        let throttler = match &mut self.throttler {
            Some(t) => t,
            None => return,
        };
        if let Some(change) = throttler.pump(self.activity.as_ref()) {
            let mut state = self.shared.lock.lock().unwrap();
            state.dynamic_max_jobs = change.max_jobs;
            state.printer.print_warning(&change.message);
            self.shared.max_jobs_changed.notify_all();
        }
    }

    /// Tear the queue down: stop workers, join them, destroy shared
    /// resources, replay deferred failure output.  Returns the final node
    /// states for persisting.
    pub fn destroy(self) -> BuildSummary {
        tracing::debug!("destroying build queue");
        {
            let mut state = self.shared.lock.lock().unwrap();
            state.main_wants_cleanup = true;
            // Workers are either waiting for work or waiting out a throttle;
            // wake both kinds so they observe the flag and exit.
            self.shared.work_available.notify_all();
            self.shared.max_jobs_changed.notify_all();
        }

        for handle in self.threads {
            let _ = handle.join();
        }

        self.shared.resources.destroy_all();

        let shared = Arc::try_unwrap(self.shared)
            .unwrap_or_else(|_| panic!("worker threads still hold the queue"));
        let mut state = shared.lock.into_inner().unwrap();
        state.printer.print_deferred();

        BuildSummary {
            processed_node_count: state.processed_count,
            failed_node_count: state.failed_count,
            node_states: state.nodes.into_vec(),
        }
    }

    /// Snapshot of how many expensive nodes are running; test hook for the
    /// admission bound.
    pub fn expensive_running(&self) -> usize {
        self.shared.lock.lock().unwrap().expensive_running
    }

    /// Current worker concurrency ceiling, as adjusted by throttling.
    pub fn dynamic_max_jobs(&self) -> u32 {
        self.shared.lock.lock().unwrap().dynamic_max_jobs
    }
}
