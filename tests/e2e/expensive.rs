use crate::*;

/// Three expensive nodes, one expensive slot, four workers.  Each action
/// takes a crude on-disk mutex: if the lock file already exists, another
/// expensive action is running concurrently and the action fails.
#[test]
fn expensive_admission_is_bounded() {
    let space = TestSpace::new();
    let lock = space.path("expensive.lock");

    let mut b = DagBuilder::new().max_expensive(1);
    for name in ["link-a", "link-b", "link-c"] {
        let out = space.path(name);
        b.add(
            TestNode::new(
                name,
                &format!(
                    "test ! -f {lock} || exit 1; touch {lock}; sleep 0.2; rm {lock}; touch {out}",
                    lock = lock,
                    out = out
                ),
            )
            .output(&out)
            .flag(NodeFlags::EXPENSIVE),
        );
    }
    let dag = b.finish(&space);

    let mut options = options_with_threads(4);
    options.max_expensive_count = 1;
    let outcome = build(&dag, options);

    assert_eq!(outcome.result, BuildResult::Ok);
    assert!(space.exists("link-a"));
    assert!(space.exists("link-b"));
    assert!(space.exists("link-c"));
}

/// Cheap work is not starved while expensive nodes queue for their slot.
#[test]
fn cheap_nodes_run_alongside_parked_expensive() {
    let space = TestSpace::new();

    let mut b = DagBuilder::new().max_expensive(1);
    for name in ["heavy-a", "heavy-b"] {
        let out = space.path(name);
        b.add(
            TestNode::new(name, &format!("sleep 0.2 && touch {}", out))
                .output(&out)
                .flag(NodeFlags::EXPENSIVE),
        );
    }
    for i in 0..6 {
        let out = space.path(&format!("cheap-{}", i));
        b.add(TestNode::new(&format!("cheap-{}", i), &format!("touch {}", out)).output(&out));
    }
    let dag = b.finish(&space);

    let mut options = options_with_threads(4);
    options.max_expensive_count = 1;
    let outcome = build(&dag, options);

    assert_eq!(outcome.result, BuildResult::Ok);
    for i in 0..6 {
        assert!(space.exists(&format!("cheap-{}", i)));
    }
    assert!(space.exists("heavy-a"));
    assert!(space.exists("heavy-b"));
}
