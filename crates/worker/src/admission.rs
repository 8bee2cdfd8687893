//! Admission gate bounding concurrent generations

use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_common::METRICS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Semaphore-backed gate; callers hold an owned permit for the whole
/// generation and release it by dropping it.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
    waiting: AtomicUsize,
    max_wait: Option<Duration>,
}

/// Keeps the waiting counter accurate when an acquire is cancelled
struct WaitingGuard<'a>(&'a AdmissionGate);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
        METRICS.worker.waiting_requests.dec();
    }
}

impl AdmissionGate {
    pub fn new(limit: usize, max_wait: Option<Duration>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            waiting: AtomicUsize::new(0),
            max_wait,
        }
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Calls blocked in `acquire`
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// In-flight plus waiting callers, as reported to the controller
    pub fn queue_length(&self) -> usize {
        self.in_flight() + self.waiting()
    }

    /// Wait for a slot, giving up with `AdmissionExhausted` once the
    /// configured wait cap elapses.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        METRICS.worker.waiting_requests.inc();
        let _waiting = WaitingGuard(self);
        let start = Instant::now();

        let acquire = self.semaphore.clone().acquire_owned();
        let permit = match self.max_wait {
            Some(max_wait) => match tokio::time::timeout(max_wait, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Admission wait exceeded {:?}", max_wait);
                    return Err(ChatFleetError::admission_exhausted(format!(
                        "no generation slot freed within {} ms",
                        max_wait.as_millis()
                    )));
                }
            },
            None => acquire.await,
        }
        .map_err(|_| ChatFleetError::Internal("admission gate closed".to_string()))?;

        METRICS.worker.admission_wait.observe(start.elapsed().as_secs_f64());
        debug!("Admitted request, {} in flight", self.in_flight());
        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_queue_length_counts_waiters() {
        let gate = Arc::new(AdmissionGate::new(1, None));
        let first = gate.acquire().await.unwrap();
        assert_eq!(gate.queue_length(), 1);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(drop) })
        };
        tokio::task::yield_now().await;
        assert_eq!(gate.waiting(), 1);
        assert_eq!(gate.queue_length(), 2);

        drop(first);
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_not_counted() {
        let gate = AdmissionGate::new(1, None);
        let _held = gate.acquire().await.unwrap();

        assert!(gate.acquire().now_or_never().is_none());
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cap_reports_overload() {
        let gate = AdmissionGate::new(1, Some(Duration::from_millis(50)));
        let _held = gate.acquire().await.unwrap();

        let result = gate.acquire().await;

        assert!(matches!(result, Err(ChatFleetError::AdmissionExhausted(_))));
        assert_eq!(gate.waiting(), 0);
    }
}
