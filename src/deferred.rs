//! Background jobs that must finish before the process exits, such as billing a
//! stream after its last byte has been handed to the client.

use std::future::Future;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct DeferredJobs {
    tracker: TaskTracker,
}

impl DeferredJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(job);
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting jobs and wait up to `grace` for the pending ones.
    ///
    /// Returns `false` if the grace period ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, "waiting for deferred jobs");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending = self.tracker.len(),
                    grace_secs = grace.as_secs(),
                    "deferred jobs still running at shutdown"
                );
                false
            }
        }
    }

    /// Wait for every job spawned so far, then keep accepting new ones.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
