//! Admission queue for the continuous-batching engine
//!
//! Requests wait in a lock-free queue until the engine loop has a free batch
//! slot. The loop blocks only when it has nothing running; otherwise it
//! tops up its batch without waiting.

use crate::backend::{BackendOutput, Sequence};
use chatfleet_common::config::BatchingConfig;
use chatfleet_common::error::{ChatFleetError, Result};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, trace};

/// A request waiting for, or occupying, a batch slot
pub(crate) struct PendingSequence {
    pub(crate) sequence: Sequence,
    pub(crate) tx: mpsc::UnboundedSender<Result<BackendOutput>>,
    pub(crate) arrival_time: Instant,
}

pub(crate) struct BatchScheduler {
    config: BatchingConfig,

    /// Request queue (lock-free)
    queue: SegQueue<PendingSequence>,

    /// Current queue depth
    queue_depth: AtomicUsize,

    shutdown: AtomicBool,

    /// Notification for new requests
    notify: Notify,
}

impl BatchScheduler {
    pub(crate) fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            queue: SegQueue::new(),
            queue_depth: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    /// Queue a request; fails when the queue is full
    pub(crate) fn submit(&self, pending: PendingSequence) -> Result<()> {
        if self.queue_depth.load(Ordering::Relaxed) >= self.config.max_queue_size {
            return Err(ChatFleetError::admission_exhausted(
                "batch queue is full, rejecting new request",
            ));
        }

        self.queue.push(pending);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();

        trace!("Request queued, depth {}", self.queue_depth.load(Ordering::Relaxed));
        Ok(())
    }

    fn pop(&self) -> Option<PendingSequence> {
        let pending = self.queue.pop()?;
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        Some(pending)
    }

    /// Take up to `free_slots` queued requests.
    ///
    /// With `idle` set the call waits for a first request, then keeps
    /// collecting for the batching window. Returns `None` after shutdown.
    pub(crate) async fn next_admissions(
        &self,
        free_slots: usize,
        idle: bool,
    ) -> Option<Vec<PendingSequence>> {
        let mut admitted = Vec::new();

        if idle {
            loop {
                if self.is_shutdown() {
                    return None;
                }
                if let Some(pending) = self.pop() {
                    admitted.push(pending);
                    break;
                }
                self.notify.notified().await;
            }

            let batching_window = Duration::from_millis(self.config.batching_window_ms);
            let start = Instant::now();
            while admitted.len() < free_slots {
                if let Some(pending) = self.pop() {
                    admitted.push(pending);
                    continue;
                }
                let remaining = batching_window.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    break;
                }
                let _ = timeout(remaining, self.notify.notified()).await;
            }
        } else {
            if self.is_shutdown() {
                return None;
            }
            while admitted.len() < free_slots {
                match self.pop() {
                    Some(pending) => admitted.push(pending),
                    None => break,
                }
            }
        }

        if !admitted.is_empty() {
            debug!(
                "Admitted {} requests, oldest waited {:?}",
                admitted.len(),
                admitted.iter().map(|p| p.arrival_time.elapsed()).max().unwrap_or_default()
            );
        }
        Some(admitted)
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        // wakes a loop that has not started waiting yet
        self.notify.notify_one();
    }
}
