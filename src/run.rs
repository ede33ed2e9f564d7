//! Driver: option parsing and the top-level build sequence. Loads the DAG,
//! runs each pass through the queue, persists state and caches, sweeps
//! stale outputs, and maps the outcome to an exit code.

use crate::fs;
use crate::load;
use crate::logging;
use crate::queue::{BuildQueue, BuildQueueConfig, BuildResult, QueueOptions};
use crate::statefile;
use crate::structlog;
use crate::sweep;

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// taiga, an incremental parallel build executor
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input frozen DAG file [default=build.dag.json]
    #[argh(option, short = 'f', default = "(\"build.dag.json\".into())")]
    dag_file: String,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// print failures as they happen instead of at the end
    #[argh(switch, short = 'k')]
    continue_on_error: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// decide which nodes are out of date, but run nothing
    #[argh(switch)]
    dry_run: bool,

    /// remove all current outputs instead of building
    #[argh(switch)]
    clean: bool,

    /// shrink the worker pool while a human is using the machine
    #[argh(switch)]
    throttle: bool,

    /// seconds of inactivity before unthrottling [default=30]
    #[argh(option, default = "30")]
    throttle_inactivity_period: u32,

    /// worker count while throttled (0 = 60% of the pool)
    #[argh(option, default = "0")]
    throttled_threads_amount: u32,

    /// targets to build (annotations or output paths)
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

fn clean_outputs(loaded: &load::LoadedBuild) -> i32 {
    let mut count = 0;
    for state in &loaded.node_states {
        let node = loaded.dag.node(state.dag_index);
        for f in node.output_files.iter().chain(&node.aux_output_files) {
            if fs::remove_file_or_dir(&f.path).is_ok() {
                count += 1;
            }
        }
    }
    println!("Removed {} output files", count);
    0
}

fn run_impl(opts: Opts) -> anyhow::Result<i32> {
    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir)
            .map_err(|err| anyhow::anyhow!("chdir {:?}: {}", dir, err))?;
    }

    // Load failures are setup errors, reported with their own exit code so
    // wrappers can tell "the build failed" from "we never built".
    let loaded = match load::read(&opts.dag_file, &opts.targets) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("taiga: {:#}", err);
            return Ok(BuildResult::SetupError.exit_code());
        }
    };

    if opts.clean {
        return Ok(clean_outputs(&loaded));
    }

    if let Some(path) = &loaded.dag.structured_log_filename {
        structlog::open(path)?;
    }

    let thread_count = opts.parallelism.unwrap_or_else(default_parallelism);
    let max_expensive = match loaded.dag.max_expensive_count {
        n if n <= 0 => thread_count,
        n => (n as usize).min(thread_count),
    };

    let options = QueueOptions {
        thread_count,
        echo_cmdline: opts.verbose,
        continue_on_error: opts.continue_on_error,
        dry_run: opts.dry_run,
        max_expensive_count: max_expensive,
        throttle_on_human_activity: opts.throttle,
        throttle_inactivity_period: opts.throttle_inactivity_period,
        throttled_threads_amount: opts.throttled_threads_amount,
    };

    let dag = loaded.dag.clone();
    let prior_state = loaded.prior_state.clone();
    let stat_cache = loaded.stat_cache.clone();
    let digest_cache = loaded.digest_cache.clone();
    let scan_cache = loaded.scan_cache.clone();

    let mut queue = BuildQueue::new(BuildQueueConfig {
        dag: dag.clone(),
        prior_state: prior_state.clone(),
        stat_cache: stat_cache.clone(),
        digest_cache: digest_cache.clone(),
        scan_cache: scan_cache.clone(),
        node_states: loaded.node_states,
        remap: loaded.remap,
        options,
    });

    let mut result = BuildResult::Ok;
    for range in &loaded.pass_ranges {
        result = queue.build_node_range(range.start, range.count, range.pass_index);
        if result != BuildResult::Ok {
            break;
        }
    }

    let summary = queue.destroy();
    structlog::close();

    let mut exit_code = result.exit_code();

    // State persists whatever happened; the next build should know as much
    // as this one did.  A failed save doesn't change the build result, but
    // the driver still reports it.
    if let Err(err) = statefile::save_build_state(
        &dag,
        prior_state.as_deref(),
        &summary.node_states,
        &stat_cache,
        &scan_cache,
    ) {
        eprintln!("taiga: failed to save build state: {:#}", err);
        if exit_code == 0 {
            exit_code = 1;
        }
    }

    if let Err(err) = scan_cache.save(&dag.scan_cache_filename, &dag.scan_cache_filename_tmp) {
        tracing::warn!(%err, "failed to save scan cache");
    }
    if let Err(err) = digest_cache.save(
        &dag.digest_cache_filename,
        &dag.digest_cache_filename_tmp,
        dag.days_to_keep_unreferenced_nodes,
    ) {
        tracing::warn!(%err, "failed to save digest cache");
    }

    sweep::remove_stale_outputs(&dag, prior_state.as_deref());

    match result {
        BuildResult::Ok => {
            println!(
                "{}: {} items updated",
                if dag.build_title.is_empty() {
                    "taiga"
                } else {
                    &dag.build_title
                },
                summary.processed_node_count
            );
        }
        other => println!("taiga: {}", other),
    }

    Ok(exit_code)
}

pub fn run() -> anyhow::Result<i32> {
    logging::init();
    let opts: Opts = argh::from_env();
    run_impl(opts)
}
