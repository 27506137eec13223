//! Run deadlines
//!
//! A [`Deadline`] is created once per pipeline run and handed down to every
//! component. Each blocking call is wrapped in [`Deadline::bound`], which
//! applies the shorter of the call's own cap and the time the run has left.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline exceeded after {0:?}")]
pub struct DeadlineExceeded(pub Duration);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Runs `fut` for at most `cap`, and never past the deadline
    pub async fn bound<F: Future>(
        &self,
        cap: Duration,
        fut: F,
    ) -> Result<F::Output, DeadlineExceeded> {
        let budget = cap.min(self.remaining());
        tokio::time::timeout(budget, fut)
            .await
            .map_err(|_| DeadlineExceeded(budget))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bound_uses_shorter_of_cap_and_remaining() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let err = deadline
            .bound(Duration::from_secs(60), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err, DeadlineExceeded(Duration::from_secs(5)));

        let deadline = Deadline::after(Duration::from_secs(60));
        let err = deadline
            .bound(Duration::from_secs(2), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err, DeadlineExceeded(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_future_passes_through() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let value = deadline.bound(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let deadline = Deadline::after(Duration::from_secs(1));
        assert!(!deadline.is_expired());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
