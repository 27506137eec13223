//! Cancellation requests
//!
//! Marks are checked by the pipeline between stages and by the orchestrator
//! when a job ends, so a deleted job is reported as cancelled rather than
//! failed. Stages that wait on something other than a job (a capacity
//! permit, another build of the same key) race their wait against
//! [`Cancellations::cancelled`].

use dashmap::DashSet;
use tokio::sync::Notify;

/// Request ids whose builds were asked to stop
#[derive(Debug, Default)]
pub struct Cancellations {
    requested: DashSet<String>,
    signal: Notify,
}

impl Cancellations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the request was already marked
    pub fn request(&self, request_id: &str) -> bool {
        let marked = self.requested.insert(request_id.to_string());
        self.signal.notify_waiters();
        marked
    }

    pub fn is_requested(&self, request_id: &str) -> bool {
        self.requested.contains(request_id)
    }

    /// Resolves once `request_id` is marked
    pub async fn cancelled(&self, request_id: &str) {
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            // Registered before the check so a mark set in between is not missed
            notified.as_mut().enable();

            if self.is_requested(request_id) {
                return;
            }
            notified.await;
        }
    }

    /// Forgets the mark once the build is terminal
    pub fn clear(&self, request_id: &str) {
        self.requested.remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.requested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }
}
