use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Bounds how much concurrent generation work is in flight.
///
/// The server's receive loop calls `wait_for_capacity()` before each poll of
/// the inbound channel; while the in-flight set is at `max_jobs` the loop is
/// simply not polling, which is the "detached listener" backpressure point.
/// Capacity is re-evaluated on every registration and every release.
///
/// Replayed requests are registered before the first poll, so a crashed
/// server full of recovered work does not over-admit on restart.
pub struct AdmissionController {
    max_jobs: usize,
    jobs: Mutex<HashSet<String>>,
    freed: Notify,
}

impl AdmissionController {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs: max_jobs.max(1),
            jobs: Mutex::new(HashSet::new()),
            freed: Notify::new(),
        }
    }

    /// Track a request. Returns false if the id is already in flight
    /// (duplicate request: answered not-OK by the caller).
    ///
    /// Registration is unconditional with respect to capacity: replayed
    /// requests are already durable and must run even if they exceed
    /// `max_jobs`; the listener just stays detached until they drain.
    pub fn register(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock();
        let added = jobs.insert(id.to_string());
        if added {
            debug!("{} generation jobs now in flight", jobs.len());
        }
        added
    }

    pub fn release(&self, id: &str) {
        let mut jobs = self.jobs.lock();
        jobs.remove(id);
        let len = jobs.len();
        drop(jobs);
        debug!("{} generation jobs in flight after completion", len);
        self.freed.notify_waiters();
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn at_capacity(&self) -> bool {
        self.in_flight() >= self.max_jobs
    }

    /// Park until there is room for one more generation job.
    pub async fn wait_for_capacity(&self) {
        loop {
            let freed = self.freed.notified();
            if !self.at_capacity() {
                return;
            }
            info!(
                "at max concurrency ({}), inbound listener detached",
                self.max_jobs
            );
            freed.await;
        }
    }
}
