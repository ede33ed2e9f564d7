use crate::*;

#[test]
fn first_run_builds_and_persists() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Write out.txt", &format!("echo hi > {}", out))
            .output(&out)
            .flag(NodeFlags::OVERWRITE_OUTPUTS),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(2));
    assert_eq!(outcome.result, BuildResult::Ok);
    assert!(space.exists("out.txt"));
    assert_eq!(outcome.summary.failed_node_count, 0);

    let state = load_state(&dag);
    assert_eq!(state.nodes.len(), 1);
    assert_eq!(state.nodes[0].guid, dag.node_guids[0]);
    assert_eq!(state.nodes[0].build_result, 0);
    assert!(!state.nodes[0].input_signature.is_zero());
    assert!(state.nodes[0].dags_seen.contains(&dag.hashed_identifier));
}

#[test]
fn second_run_is_up_to_date() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Write out.txt", &format!("echo hi > {}", out))
            .output(&out)
            .flag(NodeFlags::OVERWRITE_OUTPUTS),
    );
    let dag = b.finish(&space);

    build(&dag, options_with_threads(2));
    let first_mtime = space.mtime("out.txt");

    let outcome = build(&dag, options_with_threads(2));
    assert_eq!(outcome.result, BuildResult::Ok);
    assert_eq!(outcome.summary.processed_node_count, 1);
    // No process was spawned, so the output was not rewritten.
    assert_eq!(space.mtime("out.txt"), first_mtime);
}

#[test]
fn empty_action_node_succeeds() {
    let space = TestSpace::new();
    let mut b = DagBuilder::new();
    b.add(TestNode::new("Group node", ""));
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::Ok);
    assert_eq!(outcome.summary.processed_node_count, 1);
}

#[test]
fn failing_node_reports_build_error_and_retries() {
    let space = TestSpace::new();
    let out = space.path("out.txt");
    let log = space.path("attempts.log");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new(
            "Fail",
            &format!("echo try >> {} && echo partial > {} && exit 1", log, out),
        )
        .output(&out),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::BuildError);
    assert_eq!(outcome.summary.failed_node_count, 1);
    // Output of the failed action is cleaned up.
    assert!(!space.exists("out.txt"));

    let state = load_state(&dag);
    assert_eq!(state.nodes[0].build_result, 1);

    // The failure is retried on the next run even though nothing changed.
    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::BuildError);
    assert_eq!(space.read("attempts.log").lines().count(), 2);
}

#[test]
fn precious_outputs_survive_failure() {
    let space = TestSpace::new();
    let out = space.path("incremental.bin");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Link", &format!("echo partial > {} && exit 1", out))
            .output(&out)
            .flag(NodeFlags::PRECIOUS_OUTPUTS),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::BuildError);
    assert!(space.exists("incremental.bin"));
}

#[test]
fn unexpected_console_output_fails_the_node() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Noisy", &format!("echo warning: spooky && touch {}", out)).output(&out),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::BuildError);
}

#[test]
fn allowed_output_substrings_swallow_known_noise() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new(
            "Noisy but known",
            &format!("echo Creating library out.lib && echo ok > {}", out),
        )
        .output(&out)
        .allowed_output("Creating library"),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::Ok);
    assert!(space.exists("out.txt"));
}

#[test]
fn allow_unexpected_output_flag_passes_noise() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Chatty", &format!("echo whatever && touch {}", out))
            .output(&out)
            .flag(NodeFlags::ALLOW_UNEXPECTED_OUTPUT),
    );
    let dag = b.finish(&space);

    assert_eq!(build(&dag, options_with_threads(1)).result, BuildResult::Ok);
}

#[test]
fn unwritten_output_file_fails_and_is_preserved() {
    let space = TestSpace::new();
    space.write("out.txt", "stale content");
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Forgets to write", "true")
            .output(&out)
            .flag(NodeFlags::OVERWRITE_OUTPUTS),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::BuildError);
    // The untouched file is not deleted; the failure was exactly that it
    // wasn't written.
    assert!(space.exists("out.txt"));
    assert_eq!(space.read("out.txt"), "stale content");
}

#[test]
fn allow_unwritten_output_files_skips_the_check() {
    let space = TestSpace::new();
    space.write("out.txt", "stale content");
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Sometimes writes", "true")
            .output(&out)
            .flag(NodeFlags::OVERWRITE_OUTPUTS)
            .flag(NodeFlags::ALLOW_UNWRITTEN_OUTPUT_FILES),
    );
    let dag = b.finish(&space);

    assert_eq!(build(&dag, options_with_threads(1)).result, BuildResult::Ok);
}

#[test]
fn env_vars_reach_the_action() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Env", &format!("echo $GREETING > {}", out))
            .output(&out)
            .env("GREETING", "bonjour"),
    );
    let dag = b.finish(&space);

    assert_eq!(build(&dag, options_with_threads(1)).result, BuildResult::Ok);
    assert_eq!(space.read("out.txt").trim(), "bonjour");
}

#[test]
fn pre_action_runs_before_the_action() {
    let space = TestSpace::new();
    let marker = space.path("pre.marker");
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Two stage", &format!("test -f {} && touch {}", marker, out))
            .pre_action(&format!("touch {}", marker))
            .output(&out),
    );
    let dag = b.finish(&space);

    assert_eq!(build(&dag, options_with_threads(1)).result, BuildResult::Ok);
    assert!(space.exists("out.txt"));
}

#[test]
fn pre_action_failure_skips_the_action() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("Broken pre", &format!("touch {}", out))
            .pre_action("exit 1")
            .output(&out),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(1));
    assert_eq!(outcome.result, BuildResult::BuildError);
    assert!(!space.exists("out.txt"));
}

#[test]
fn outputs_are_deleted_before_run_without_overwrite_flag() {
    let space = TestSpace::new();
    let out = space.path("out.txt");
    // The action appends; without the overwrite flag the old file must be
    // removed first, so the result has exactly one line per run.
    let mut b = DagBuilder::new();
    b.add(TestNode::new("Append", &format!("echo line >> {}", out)).output(&out));
    let dag = b.finish(&space);

    assert_eq!(build(&dag, options_with_threads(1)).result, BuildResult::Ok);
    // Force a rebuild by removing the state file.
    std::fs::remove_file(dag.state_filename.clone()).unwrap();
    assert_eq!(build(&dag, options_with_threads(1)).result, BuildResult::Ok);
    assert_eq!(space.read("out.txt").lines().count(), 1);
}

#[test]
fn dry_run_decides_but_does_not_execute() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new();
    b.add(TestNode::new("Write", &format!("echo hi > {}", out)).output(&out));
    let dag = b.finish(&space);

    let mut options = options_with_threads(2);
    options.dry_run = true;
    let outcome = build(&dag, options);
    assert_eq!(outcome.result, BuildResult::Ok);
    assert!(!space.exists("out.txt"));

    // A real run afterwards builds for real.
    let outcome = build(&dag, options_with_threads(2));
    assert_eq!(outcome.result, BuildResult::Ok);
    assert!(space.exists("out.txt"));
}

#[test]
fn output_parent_directories_are_created() {
    let space = TestSpace::new();
    let out = space.path("deep/nested/dir/out.txt");

    let mut b = DagBuilder::new();
    b.add(TestNode::new("Nested", &format!("echo hi > {}", out)).output(&out));
    let dag = b.finish(&space);

    assert_eq!(build(&dag, options_with_threads(1)).result, BuildResult::Ok);
    assert!(space.exists("deep/nested/dir/out.txt"));
}
