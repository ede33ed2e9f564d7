use crate::*;

fn two_output_dag(space: &TestSpace) -> std::sync::Arc<DagData> {
    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("a", &format!("echo a > {}", space.path("out/a.txt")))
            .output(&space.path("out/a.txt")),
    );
    b.add(
        TestNode::new("b", &format!("echo b > {}", space.path("out/sub/b.txt")))
            .output(&space.path("out/sub/b.txt")),
    );
    b.finish(space)
}

fn one_output_dag(space: &TestSpace, identifier: u32) -> std::sync::Arc<DagData> {
    let mut b = DagBuilder::new().identifier(identifier);
    b.add(
        TestNode::new("a", &format!("echo a > {}", space.path("out/a.txt")))
            .output(&space.path("out/a.txt")),
    );
    b.finish(space)
}

#[test]
fn outputs_no_longer_produced_are_swept() {
    let space = TestSpace::new();
    let dag_full = two_output_dag(&space);
    build(&dag_full, options_with_threads(2));
    assert!(space.exists("out/sub/b.txt"));

    // The frontend re-emits the DAG without node b; the next build sweeps
    // b's output and its emptied directory.
    let dag_small = one_output_dag(&space, dag_full.hashed_identifier);
    let outcome = build(&dag_small, options_with_threads(2));
    assert_eq!(outcome.result, BuildResult::Ok);
    assert!(space.exists("out/a.txt"));
    assert!(!space.exists("out/sub/b.txt"));
    assert!(!space.exists("out/sub"));
    // The shared parent still has a.txt in it, so it survives.
    assert!(space.exists("out"));

    // The retired node's record is dropped from the persisted state.
    let state = load_state(&dag_small);
    assert_eq!(state.nodes.len(), 1);
}

#[test]
fn sweep_is_idempotent() {
    let space = TestSpace::new();
    let dag_full = two_output_dag(&space);
    build(&dag_full, options_with_threads(2));

    let prior = load_state(&dag_full);
    let dag_small = one_output_dag(&space, dag_full.hashed_identifier);

    let removed = sweep::remove_stale_outputs(&dag_small, Some(&prior));
    assert!(removed > 0);
    assert!(!space.exists("out/sub/b.txt"));

    // A second pass has nothing left to remove.
    let removed = sweep::remove_stale_outputs(&dag_small, Some(&prior));
    assert_eq!(removed, 0);
}

#[test]
fn other_dags_outputs_are_left_alone() {
    let space = TestSpace::new();
    let dag_full = two_output_dag(&space);
    build(&dag_full, options_with_threads(2));

    // A DAG with a different identifier never saw these nodes; their
    // outputs are not its to sweep.
    let prior = load_state(&dag_full);
    let dag_other = one_output_dag(&space, 0xdead);
    let removed = sweep::remove_stale_outputs(&dag_other, Some(&prior));
    assert_eq!(removed, 0);
    assert!(space.exists("out/sub/b.txt"));
}

#[test]
fn aux_outputs_are_swept_too() {
    let space = TestSpace::new();

    let mut b = DagBuilder::new();
    b.add(
        TestNode::new(
            "gen",
            &format!(
                "echo x > {} && echo y > {}",
                space.path("gen.txt"),
                space.path("gen.aux")
            ),
        )
        .output(&space.path("gen.txt"))
        .aux_output(&space.path("gen.aux")),
    );
    let dag = b.finish(&space);
    build(&dag, options_with_threads(1));
    assert!(space.exists("gen.aux"));

    // The replacement DAG drops the node entirely; both its declared
    // outputs go.
    let mut b = DagBuilder::new();
    b.add(
        TestNode::new("other", &format!("echo z > {}", space.path("other.txt")))
            .output(&space.path("other.txt")),
    );
    let dag2 = b.finish(&space);
    build(&dag2, options_with_threads(1));
    assert!(!space.exists("gen.txt"));
    assert!(!space.exists("gen.aux"));
}
