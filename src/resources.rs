//! Shared build resources: side-channel dependencies (an emulator, a device
//! connection) with create/destroy actions run at most once per build.
//!
//! Reference counts track how many nodes acquired each resource; creation is
//! double-checked under a single lock so concurrent acquirers of the same
//! resource race safely.  Everything still alive is destroyed at queue
//! teardown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::exec;
use crate::graph::SharedResourceData;
use crate::printing;

pub struct SharedResources {
    data: Vec<SharedResourceData>,
    refcounts: Vec<AtomicU32>,
    create_lock: Mutex<()>,
}

fn run_resource_action(resource: &SharedResourceData, action: &str, verb: &str) -> bool {
    let annotation = format!("{} {}", verb, resource.annotation);
    let started = Instant::now();
    let result = exec::execute_process(action, &resource.env_vars, None, Duration::from_secs(1));
    printing::print_non_node_action_result(
        &annotation,
        started.elapsed(),
        result.return_code == 0,
        &result.output,
    );
    result.return_code == 0
}

impl SharedResources {
    pub fn new(data: &[SharedResourceData]) -> SharedResources {
        SharedResources {
            data: data.to_vec(),
            refcounts: data.iter().map(|_| AtomicU32::new(0)).collect(),
            create_lock: Mutex::new(()),
        }
    }

    /// Acquire one reference, creating the resource if this is the first.
    /// Returns false when the create action failed; the caller's node fails.
    pub fn acquire(&self, index: usize) -> bool {
        if self.refcounts[index].load(Ordering::SeqCst) == 0 {
            let _guard = self.create_lock.lock().unwrap();
            // Another thread may have created it while we waited.
            if self.refcounts[index].load(Ordering::SeqCst) == 0 {
                let resource = &self.data[index];
                if let Some(create) = &resource.create_action {
                    if !run_resource_action(resource, create, "Creating") {
                        tracing::error!(
                            annotation = %resource.annotation,
                            "failed to create shared resource"
                        );
                        return false;
                    }
                }
                self.refcounts[index].fetch_add(1, Ordering::SeqCst);
                return true;
            }
        }
        self.refcounts[index].fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Destroy everything that was created.  Destroy failures are logged and
    /// otherwise ignored; teardown must finish.
    pub fn destroy_all(&self) {
        for (index, refcount) in self.refcounts.iter().enumerate() {
            if refcount.load(Ordering::SeqCst) > 0 {
                let resource = &self.data[index];
                if let Some(destroy) = &resource.destroy_action {
                    if !run_resource_action(resource, destroy, "Destroying") {
                        tracing::warn!(
                            annotation = %resource.annotation,
                            "failed to destroy shared resource"
                        );
                    }
                }
                refcount.store(0, Ordering::SeqCst);
            }
        }
    }

    pub fn refcount(&self, index: usize) -> u32 {
        self.refcounts[index].load(Ordering::SeqCst)
    }
}
