//! Executes one node's action: set up its output directories, honor the
//! output-deletion policy, run the pre-action and action, validate what came
//! back, and clean up after failure.
//!
//! The queue lock is dropped around every blocking step and re-acquired
//! before the result is recorded.

use std::io::Write;
use std::path::Path;
use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use crate::exec::{self, ExecResult};
use crate::fs;
use crate::nodestate::{BuildProgress, StateId};
use crate::queue::{self, QueueShared, QueueState};
use crate::signal;
use crate::statcache::StatCache;
use crate::validation::{self, ValidationResult};

/// How often a long-running action is reported to the console.
const SLOW_CALLBACK_INTERVAL: Duration = Duration::from_secs(10);
/// Pre-actions are expected to be quick; report them sooner.
const PRE_ACTION_SLOW_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct ActionOutcome {
    pub next: BuildProgress,
    /// Whether this invocation took an expensive slot that the caller must
    /// give back.
    pub counted_expensive: bool,
}

fn make_directories_recursive(stat_cache: &StatCache, dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        if parent != dir {
            make_directories_recursive(stat_cache, parent)?;
        }
    }
    let dir_str = dir.to_string_lossy();
    if stat_cache.stat(&dir_str).exists {
        // Just assume an existing path is a directory; a file in the way
        // surfaces as the create below or the action itself failing.
        return Ok(());
    }
    tracing::trace!(dir = %dir_str, "create dir");
    match std::fs::create_dir(dir) {
        Ok(()) => {}
        // Another worker may create the same parent concurrently.
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
    }
    stat_cache.mark_dirty(&dir_str);
    Ok(())
}

fn make_directories_for_file(stat_cache: &StatCache, file_path: &str) -> std::io::Result<()> {
    match Path::new(file_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            make_directories_recursive(stat_cache, parent)
        }
        _ => Ok(()),
    }
}

/// A write-text-file action: the node's action text is the file content.
fn write_text_file(payload: &str, target_file: &str) -> ExecResult {
    let mut f = match std::fs::File::create(target_file) {
        Ok(f) => f,
        Err(err) => {
            return ExecResult::failure(format!(
                "Error opening for writing the file: {}, error: {}",
                target_file, err
            ))
        }
    };
    if let Err(err) = f.write_all(payload.as_bytes()) {
        return ExecResult::failure(format!(
            "failed to write {} bytes to {}: {}",
            payload.len(),
            target_file,
            err
        ));
    }
    ExecResult::success()
}

pub(crate) fn run_action<'a>(
    shared: &'a QueueShared,
    mut guard: MutexGuard<'a, QueueState>,
    id: StateId,
) -> (MutexGuard<'a, QueueState>, ActionOutcome) {
    let dag_index = guard.nodes.get(id).dag_index;
    let node = shared.dag.node(dag_index);
    let is_write_file = node.flags.write_text_file();
    let dry_run = shared.options.dry_run;

    // Nodes with no action to run (pure dependency grouping) complete
    // immediately.
    if !is_write_file && node.action.is_empty() {
        guard.processed_count += 1;
        return (
            guard,
            ActionOutcome {
                next: BuildProgress::Succeeded,
                counted_expensive: false,
            },
        );
    }

    let mut counted_expensive = false;
    if node.flags.expensive() && !dry_run {
        if guard.expensive_running == shared.options.max_expensive_count {
            queue::park_expensive_node(&mut guard, id);
            return (
                guard,
                ActionOutcome {
                    next: BuildProgress::RunAction,
                    counted_expensive: false,
                },
            );
        }
        guard.expensive_running += 1;
        counted_expensive = true;
    }

    drop(guard);

    let failed = |next: BuildProgress| ActionOutcome {
        next,
        counted_expensive,
    };

    for &res in &node.shared_resources {
        if !shared.resources.acquire(res as usize) {
            tracing::error!(
                annotation = %shared.dag.shared_resources[res as usize].annotation,
                "failed to create shared resource"
            );
            return (
                shared.lock.lock().unwrap(),
                failed(BuildProgress::Failed),
            );
        }
    }

    if !dry_run {
        for output in node.output_files.iter().chain(&node.aux_output_files) {
            if let Err(err) = make_directories_for_file(&shared.stat_cache, &output.path) {
                tracing::error!(path = %output.path, %err, "failed to create output directories");
                return (
                    shared.lock.lock().unwrap(),
                    failed(BuildProgress::Failed),
                );
            }
        }
    }

    // See if we need to remove the output files before running anything.
    if !node.flags.overwrite_outputs() && !dry_run {
        for output in &node.output_files {
            tracing::debug!(path = %output.path, "removing output file before running action");
            let _ = std::fs::remove_file(&output.path);
            shared.stat_cache.mark_dirty(&output.path);
        }
    }

    let started = Instant::now();
    let allow_unwritten = node.flags.allow_unwritten_output_files();
    let mut untouched = vec![false; node.output_files.len()];

    let mut slow_cb = || {
        let state = shared.lock.lock().unwrap();
        state
            .printer
            .print_node_in_progress(&node.annotation, started.elapsed());
        SLOW_CALLBACK_INTERVAL
    };

    let mut result = ExecResult::success();
    let mut last_cmd_line: Option<&str> = None;

    if let Some(pre_action) = &node.pre_action {
        tracing::trace!("launching pre-action process");
        last_cmd_line = Some(pre_action);
        if !dry_run {
            result = exec::execute_process(
                pre_action,
                &node.env_vars,
                Some(&mut slow_cb),
                PRE_ACTION_SLOW_INTERVAL,
            );
            tracing::trace!(return_code = result.return_code, "pre-action return code");
        }
    }

    let mut validation = ValidationResult::Pass;
    if result.return_code == 0 && !dry_run {
        // Snapshot output timestamps so we can tell whether the action
        // actually wrote them.
        let pre_timestamps: Vec<u64> = if allow_unwritten {
            Vec::new()
        } else {
            node.output_files
                .iter()
                .map(|f| fs::stat(&f.path).timestamp)
                .collect()
        };

        if is_write_file {
            result = write_text_file(&node.action, &node.output_files[0].path);
        } else {
            tracing::trace!("launching process");
            last_cmd_line = Some(&node.action);
            result = exec::execute_process(
                &node.action,
                &node.env_vars,
                Some(&mut slow_cb),
                SLOW_CALLBACK_INTERVAL,
            );
            validation = validation::validate_exec_result(&result, node);
            tracing::trace!(return_code = result.return_code, "process return code");
        }

        if validation == ValidationResult::Pass && !allow_unwritten {
            for (i, output) in node.output_files.iter().enumerate() {
                if fs::stat(&output.path).timestamp == pre_timestamps[i] {
                    untouched[i] = true;
                    validation = ValidationResult::UnwrittenOutputFileFail;
                }
            }
        }
    }

    for output in &node.output_files {
        shared.stat_cache.mark_dirty(&output.path);
    }

    let mut guard = shared.lock.lock().unwrap();
    guard.processed_count += 1;
    let processed = guard.processed_count;
    let untouched_paths: Vec<String> = node
        .output_files
        .iter()
        .zip(&untouched)
        .filter(|(_, &u)| u)
        .map(|(f, _)| f.path.clone())
        .collect();
    guard.printer.print_node_result(
        processed,
        &node.annotation,
        last_cmd_line,
        &result,
        validation,
        started.elapsed(),
        &untouched_paths,
    );

    if result.was_aborted {
        signal::set_reason_child_aborted();
        shared.signal_build_finished();
    }

    let success =
        result.return_code == 0 && validation < ValidationResult::UnexpectedConsoleOutputFail;
    if !success {
        // Clean up output files after a failed build, unless they are
        // precious or the failure was exactly failing to write one of them.
        let keep = node.flags.precious_outputs()
            || (result.return_code == 0 && validation == ValidationResult::UnwrittenOutputFileFail);
        if !keep {
            for output in &node.output_files {
                tracing::debug!(path = %output.path, "removing output file from failed build");
                let _ = std::fs::remove_file(&output.path);
                shared.stat_cache.mark_dirty(&output.path);
            }
        }
    }

    let next = if success {
        BuildProgress::Succeeded
    } else {
        BuildProgress::Failed
    };
    (
        guard,
        ActionOutcome {
            next,
            counted_expensive,
        },
    )
}
