use crate::*;

#[test]
fn shared_resource_created_once_and_destroyed() {
    let space = TestSpace::new();
    let created = space.path("created.log");
    let destroyed = space.path("destroyed.marker");

    let mut b = DagBuilder::new().shared_resource(
        "emulator",
        Some(&format!("echo up >> {}", created)),
        Some(&format!("touch {}", destroyed)),
    );
    for name in ["t1", "t2", "t3"] {
        let out = space.path(name);
        b.add(
            TestNode::new(name, &format!("touch {}", out))
                .output(&out)
                .shared_resource(0),
        );
    }
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(3));
    assert_eq!(outcome.result, BuildResult::Ok);
    // Created exactly once, no matter how many nodes acquired it.
    assert_eq!(space.read("created.log").lines().count(), 1);
    // Destroyed at queue teardown.
    assert!(space.exists("destroyed.marker"));
}

#[test]
fn failed_resource_creation_fails_the_node() {
    let space = TestSpace::new();
    let out = space.path("out.txt");

    let mut b = DagBuilder::new().shared_resource("broken", Some("exit 1"), None);
    b.add(
        TestNode::new("Needs resource", &format!("touch {}", out))
            .output(&out)
            .shared_resource(0),
    );
    let dag = b.finish(&space);

    let outcome = build(&dag, options_with_threads(2));
    assert_eq!(outcome.result, BuildResult::BuildError);
    assert!(!space.exists("out.txt"));
}

#[test]
fn unused_resources_are_not_created() {
    let space = TestSpace::new();
    let created = space.path("created.marker");
    let out = space.path("out.txt");

    let mut b = DagBuilder::new().shared_resource(
        "idle resource",
        Some(&format!("touch {}", created)),
        None,
    );
    b.add(TestNode::new("Plain", &format!("touch {}", out)).output(&out));
    let dag = b.finish(&space);

    assert_eq!(build(&dag, options_with_threads(2)).result, BuildResult::Ok);
    assert!(!space.exists("created.marker"));
}
