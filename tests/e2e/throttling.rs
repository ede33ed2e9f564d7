use crate::*;
use std::sync::{Arc as StdArc, Mutex};
use taiga::load::PassRange;

/// Activity source the test scripts from outside the queue.
struct ScriptedActivity(StdArc<Mutex<f64>>);

impl OsActivity for ScriptedActivity {
    fn time_since_last_activity_seconds(&self) -> f64 {
        *self.0.lock().unwrap()
    }
}

#[test]
fn human_activity_shrinks_the_worker_pool() {
    let space = TestSpace::new();

    let mut b = DagBuilder::new();
    // Long enough that the main thread pumps the throttler at least once.
    let out = space.path("out.txt");
    b.add(TestNode::new("Slow", &format!("sleep 0.5 && touch {}", out)).output(&out));
    let dag = b.finish(&space);

    let activity = StdArc::new(Mutex::new(1.5f64));

    let prior = None;
    let stat_cache = StdArc::new(StatCache::new());
    let digest_cache = StdArc::new(DigestCache::new());
    let scan_cache = StdArc::new(ScanCache::new());
    let (node_states, remap, pass_ranges) =
        load::prepare_node_states(&dag, prior, &[]).unwrap();
    assert_eq!(
        pass_ranges,
        vec![PassRange {
            pass_index: 0,
            start: 0,
            count: 1
        }]
    );

    let mut options = options_with_threads(10);
    options.throttle_on_human_activity = true;
    options.throttle_inactivity_period = 30;
    options.throttled_threads_amount = 0;

    let mut queue = BuildQueue::with_activity(
        BuildQueueConfig {
            dag: dag.clone(),
            prior_state: None,
            stat_cache,
            digest_cache,
            scan_cache,
            node_states,
            remap,
            options,
        },
        Box::new(ScriptedActivity(activity.clone())),
    );

    assert_eq!(queue.dynamic_max_jobs(), 10);
    let result = queue.build_node_range(0, 1, 0);
    assert_eq!(result, BuildResult::Ok);

    // Activity was 1.5s old throughout the build: 60% of 10 threads.
    assert_eq!(queue.dynamic_max_jobs(), 6);
    queue.destroy();
    assert!(space.exists("out.txt"));
}

#[test]
fn no_observed_activity_means_no_throttling() {
    let space = TestSpace::new();

    let mut b = DagBuilder::new();
    let out = space.path("out.txt");
    b.add(TestNode::new("Slow", &format!("sleep 0.3 && touch {}", out)).output(&out));
    let dag = b.finish(&space);

    let mut options = options_with_threads(8);
    options.throttle_on_human_activity = true;

    let outcome = build_with_activity(&dag, &[], options, None);
    assert_eq!(outcome.result, BuildResult::Ok);
}
