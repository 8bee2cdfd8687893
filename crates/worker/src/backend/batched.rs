//! Continuous-batching engine
//!
//! One engine task advances every running sequence by one step per
//! iteration and tops up the batch from the admission queue between steps.
//! Aborted or abandoned sequences leave the batch at the next iteration.

use super::{BackendRequest, GenerationBackend, OutputStream, Sequence};
use crate::batching::{BatchScheduler, PendingSequence};
use crate::model::StepModel;
use async_trait::async_trait;
use chatfleet_common::config::BatchingConfig;
use chatfleet_common::error::Result;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

/// Request ids known to the engine and the ones marked for abort
#[derive(Default)]
struct AbortState {
    live: HashSet<String>,
    aborted: HashSet<String>,
}

pub struct BatchedAsyncBackend {
    model: Arc<dyn StepModel>,
    scheduler: Arc<BatchScheduler>,
    aborts: Arc<Mutex<AbortState>>,
}

impl BatchedAsyncBackend {
    /// Create the backend and start its engine loop on the current runtime
    pub fn new(model: Arc<dyn StepModel>, config: BatchingConfig, step_delay: Duration) -> Self {
        let scheduler = Arc::new(BatchScheduler::new(config));
        let aborts = Arc::new(Mutex::new(AbortState::default()));

        tokio::spawn(engine_loop(
            model.clone(),
            scheduler.clone(),
            aborts.clone(),
            step_delay,
        ));

        Self {
            model,
            scheduler,
            aborts,
        }
    }
}

impl Drop for BatchedAsyncBackend {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

async fn engine_loop(
    model: Arc<dyn StepModel>,
    scheduler: Arc<BatchScheduler>,
    aborts: Arc<Mutex<AbortState>>,
    step_delay: Duration,
) {
    info!("Starting batched engine loop");
    let max_batch_size = scheduler.max_batch_size();
    let mut running: Vec<PendingSequence> = Vec::with_capacity(max_batch_size);

    loop {
        let free_slots = max_batch_size.saturating_sub(running.len());
        if free_slots > 0 {
            match scheduler.next_admissions(free_slots, running.is_empty()).await {
                Some(admitted) => running.extend(admitted),
                None => break,
            }
        }

        if !step_delay.is_zero() {
            tokio::time::sleep(step_delay).await;
        }

        let start = Instant::now();
        let mut retired = Vec::new();
        for (index, pending) in running.iter_mut().enumerate() {
            // the lock covers the lookup only, never a decode step
            let aborted = aborts.lock().aborted.contains(&pending.sequence.request_id);
            if aborted || pending.tx.is_closed() {
                debug!("Dropping sequence {}", pending.sequence.request_id);
                retired.push(index);
                continue;
            }

            match pending.sequence.step(model.as_ref()) {
                Ok(Some(output)) => {
                    let _ = pending.tx.send(Ok(output));
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Decode failed for {}: {}", pending.sequence.request_id, e);
                    let _ = pending.tx.send(Err(e));
                    retired.push(index);
                    continue;
                }
            }
            if pending.sequence.is_finished() {
                retired.push(index);
            }
        }

        if !retired.is_empty() {
            let mut aborts = aborts.lock();
            for index in retired.into_iter().rev() {
                let pending = running.swap_remove(index);
                aborts.live.remove(&pending.sequence.request_id);
                aborts.aborted.remove(&pending.sequence.request_id);
            }
        }

        debug!(
            "Engine step over {} sequences took {:?}, {} queued",
            running.len(),
            start.elapsed(),
            scheduler.queue_depth()
        );
        tokio::task::yield_now().await;
    }

    info!("Batched engine loop stopped");
}

#[async_trait]
impl GenerationBackend for BatchedAsyncBackend {
    async fn generate_stream(&self, request: BackendRequest) -> Result<OutputStream> {
        let sequence = Sequence::new(self.model.as_ref(), request);
        let request_id = sequence.request_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        self.aborts.lock().live.insert(request_id.clone());
        let submitted = self.scheduler.submit(PendingSequence {
            sequence,
            tx,
            arrival_time: Instant::now(),
        });
        if let Err(e) = submitted {
            self.aborts.lock().live.remove(&request_id);
            return Err(e);
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn count_token(&self, prompt: &str) -> Result<usize> {
        Ok(self.model.encode(prompt).len())
    }

    fn context_length(&self) -> usize {
        self.model.context_length()
    }

    async fn abort(&self, request_id: &str) -> Result<()> {
        let mut aborts = self.aborts.lock();
        if aborts.live.contains(request_id) {
            debug!("Aborting {}", request_id);
            aborts.aborted.insert(request_id.to_string());
        }
        Ok(())
    }

    fn supports_abort(&self) -> bool {
        true
    }
}
