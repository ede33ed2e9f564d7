//! Human-activity throttling: while someone is using the machine, shrink
//! the worker pool so the build doesn't starve them, and grow back once
//! they've been idle long enough.

/// How long ago the OS last saw human input.  Platform integrations live
/// outside the core; `NoActivityDetection` disables throttling entirely.
pub trait OsActivity {
    /// Seconds since last human activity, or -1.0 when never observed.
    fn time_since_last_activity_seconds(&self) -> f64;
}

pub struct NoActivityDetection;

impl OsActivity for NoActivityDetection {
    fn time_since_last_activity_seconds(&self) -> f64 {
        -1.0
    }
}

pub struct ActivityThrottler {
    throttled: bool,
    inactivity_period: f64,
    /// 0 means "60% of the pool, at least one".
    throttled_threads_amount: u32,
    thread_count: u32,
}

/// A max-jobs change the queue should apply and announce.
pub struct ThrottleChange {
    pub max_jobs: u32,
    pub message: String,
}

impl ActivityThrottler {
    pub fn new(
        inactivity_period: u32,
        throttled_threads_amount: u32,
        thread_count: u32,
    ) -> ActivityThrottler {
        ActivityThrottler {
            throttled: false,
            inactivity_period: inactivity_period as f64,
            throttled_threads_amount,
            thread_count,
        }
    }

    fn throttled_max_jobs(&self) -> u32 {
        if self.throttled_threads_amount != 0 {
            return self.throttled_threads_amount;
        }
        std::cmp::max(1, (self.thread_count as f64 * 0.6) as u32)
    }

    /// Polled from the main thread's build-finished wait loop.
    pub fn pump(&mut self, activity: &dyn OsActivity) -> Option<ThrottleChange> {
        let t = activity.time_since_last_activity_seconds();
        // No activity ever observed (which is also what happens right after
        // the build starts): leave the pool alone.
        if t < 0.0 {
            return None;
        }

        if !self.throttled {
            // Activity long ago: stay unthrottled.
            if t >= self.inactivity_period {
                return None;
            }
            // Activity just now: wait out the first second, so a user about
            // to abort the build isn't greeted by a throttling message.
            if t < 1.0 {
                return None;
            }
            self.throttled = true;
            let max_jobs = self.throttled_max_jobs();
            return Some(ThrottleChange {
                max_jobs,
                message: format!(
                    "Human activity detected, throttling to {} simultaneous jobs to leave system responsive",
                    max_jobs
                ),
            });
        }

        // Throttled with recent activity: stay throttled.
        if t < self.inactivity_period {
            return None;
        }
        self.throttled = false;
        Some(ThrottleChange {
            max_jobs: self.thread_count,
            message: format!(
                "No human activity detected on this machine for {} seconds, unthrottling back up to {} simultaneous jobs",
                self.inactivity_period as u32, self.thread_count
            ),
        })
    }
}
