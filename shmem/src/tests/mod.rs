use std::sync::atomic::{AtomicUsize, Ordering};

use crate::SMQueue;

mod destroy_tests;
mod torn_read_tests;

/// A queue name unique to this test process and call.
pub(crate) fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/smq_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Destroys the named queue when the test ends, pass or fail.
pub(crate) struct QueueGuard(pub String);

impl QueueGuard {
    pub fn new(tag: &str) -> QueueGuard {
        QueueGuard(unique_name(tag))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        let _ = SMQueue::destroy(&self.0);
    }
}
