//! Live-worker registry and dispatch
//!
//! All membership changes and the dispatch read go through a single mutex so
//! that the expiry sweep, heartbeats and registrations can never interleave
//! with a worker selection. The lock is never held across an `.await`.

use chatfleet_common::config::DispatchMethod;
use chatfleet_common::METRICS;
use chatfleet_proto::WorkerStatus;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Worker information for dispatch decisions
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Worker base URL, unique key
    pub address: String,

    /// Models served by this worker
    pub model_names: Vec<String>,

    /// Relative capacity weight
    pub speed: f64,

    /// In-flight plus waiting calls, as last reported
    pub queue_length: usize,

    /// Last registration, heartbeat or successful probe
    pub last_heartbeat: Instant,

    /// Whether the expiry sweep applies to this worker
    pub check_heart_beat: bool,

    /// Insertion order, kept across re-registration
    seq: u64,
}

impl WorkerRecord {
    /// Calculate load score for dispatch (lower is better)
    pub fn load_score(&self) -> f64 {
        if self.speed <= 0.0 {
            return f64::INFINITY;
        }
        self.queue_length as f64 / self.speed
    }

    pub fn serves(&self, model_name: &str) -> bool {
        self.model_names.iter().any(|m| m == model_name)
    }

    /// Check if the heartbeat lapsed past the expiry window
    pub fn is_expired(&self, now: Instant, expiration: Duration) -> bool {
        self.check_heart_beat && now.saturating_duration_since(self.last_heartbeat) > expiration
    }

    fn apply_status(&mut self, status: WorkerStatus, now: Instant) {
        self.model_names = status.model_names;
        self.speed = status.speed;
        self.queue_length = status.queue_length;
        self.last_heartbeat = now;
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    workers: HashMap<String, WorkerRecord>,

    /// model name -> addresses in insertion order
    model_index: HashMap<String, Vec<String>>,

    next_seq: u64,
}

impl RegistryState {
    fn rebuild_index(&mut self) {
        let mut records: Vec<&WorkerRecord> = self.workers.values().collect();
        records.sort_by_key(|r| r.seq);

        self.model_index.clear();
        for record in records {
            for model in &record.model_names {
                self.model_index
                    .entry(model.clone())
                    .or_default()
                    .push(record.address.clone());
            }
        }

        METRICS
            .controller
            .registered_workers
            .set(self.workers.len() as i64);
    }

    fn ordered_records(&self) -> Vec<&WorkerRecord> {
        let mut records: Vec<&WorkerRecord> = self.workers.values().collect();
        records.sort_by_key(|r| r.seq);
        records
    }
}

/// Ordering used by shortest-queue dispatch: score, then raw queue, then age
fn compare_candidates(a: &WorkerRecord, b: &WorkerRecord) -> Ordering {
    a.load_score()
        .partial_cmp(&b.load_score())
        .unwrap_or(Ordering::Equal)
        .then(a.queue_length.cmp(&b.queue_length))
        .then(a.seq.cmp(&b.seq))
}

/// Registry of live workers
#[derive(Debug)]
pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
    dispatch_method: DispatchMethod,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new(dispatch_method: DispatchMethod) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            dispatch_method,
        }
    }

    /// Insert or refresh a worker. Returns `true` when the address was new.
    pub fn register(&self, address: &str, check_heart_beat: bool, status: WorkerStatus) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let is_new = match state.workers.get_mut(address) {
            Some(record) => {
                record.check_heart_beat = check_heart_beat;
                record.apply_status(status, now);
                false
            }
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.workers.insert(
                    address.to_string(),
                    WorkerRecord {
                        address: address.to_string(),
                        model_names: status.model_names,
                        speed: status.speed,
                        queue_length: status.queue_length,
                        last_heartbeat: now,
                        check_heart_beat,
                        seq,
                    },
                );
                true
            }
        };
        state.rebuild_index();

        if let Some(record) = state.workers.get(address) {
            info!(
                "Registered worker {} (new: {}, models: {:?}, heart beat check: {})",
                address, is_new, record.model_names, check_heart_beat
            );
        }
        is_new
    }

    /// Remove a worker. Returns `true` if it was present.
    pub fn remove(&self, address: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.workers.remove(address).is_some();
        if removed {
            state.rebuild_index();
            info!("Removed worker {}", address);
        }
        removed
    }

    /// Record a heartbeat. Unknown addresses are rejected.
    pub fn heartbeat(&self, address: &str, queue_length: usize) -> bool {
        let mut state = self.state.lock();
        match state.workers.get_mut(address) {
            Some(record) => {
                record.queue_length = queue_length;
                record.last_heartbeat = Instant::now();
                debug!("Heartbeat from {} (queue length {})", address, queue_length);
                true
            }
            None => {
                warn!("Heartbeat from unknown worker {}", address);
                false
            }
        }
    }

    /// Remove every heartbeat-checked worker silent for longer than `expiration`
    pub fn remove_stale(&self, expiration: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let stale: Vec<String> = state
            .ordered_records()
            .into_iter()
            .filter(|r| r.is_expired(now, expiration))
            .map(|r| r.address.clone())
            .collect();

        if !stale.is_empty() {
            for address in &stale {
                state.workers.remove(address);
                warn!("Worker {} heartbeat expired, removed", address);
            }
            state.rebuild_index();
        }
        stale
    }

    /// Apply the outcome of a status sweep in one critical section.
    ///
    /// Failed probes and workers reporting no models are removed; the others
    /// get their status refreshed. Addresses no longer registered are ignored.
    /// Returns the removed addresses.
    pub fn apply_probe_results(&self, results: Vec<(String, Option<WorkerStatus>)>) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut removed = Vec::new();

        for (address, status) in results {
            match status {
                Some(status) if !status.model_names.is_empty() => {
                    if let Some(record) = state.workers.get_mut(&address) {
                        record.apply_status(status, now);
                    }
                }
                _ => {
                    if state.workers.remove(&address).is_some() {
                        removed.push(address);
                    }
                }
            }
        }
        state.rebuild_index();
        removed
    }

    /// All worker addresses in insertion order
    pub fn addresses(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .ordered_records()
            .into_iter()
            .map(|r| r.address.clone())
            .collect()
    }

    /// Sorted union of model names across live workers
    pub fn list_models(&self) -> Vec<String> {
        let state = self.state.lock();
        let models: BTreeSet<&String> = state.model_index.keys().collect();
        models.into_iter().cloned().collect()
    }

    /// Pick a worker for `model_name`, or `None` when nobody serves it.
    ///
    /// Shortest-queue dispatch bumps the chosen worker's queue length so that
    /// a burst of requests spreads out before the next heartbeat arrives.
    pub fn select(&self, model_name: &str) -> Option<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let chosen = {
            let candidates: Vec<&WorkerRecord> = state
                .model_index
                .get(model_name)?
                .iter()
                .filter_map(|address| state.workers.get(address))
                .collect();

            match self.dispatch_method {
                DispatchMethod::ShortestQueue => candidates
                    .iter()
                    .min_by(|a, b| compare_candidates(a, b))
                    .map(|r| r.address.clone()),
                DispatchMethod::Lottery => {
                    let weights: Vec<f64> = candidates.iter().map(|r| r.speed.max(0.0)).collect();
                    match WeightedIndex::new(&weights) {
                        Ok(dist) => {
                            let index = dist.sample(&mut rand::thread_rng());
                            Some(candidates[index].address.clone())
                        }
                        // all weights zero: fall back to the first registered
                        Err(_) => candidates.first().map(|r| r.address.clone()),
                    }
                }
            }?
        };

        if self.dispatch_method == DispatchMethod::ShortestQueue {
            if let Some(record) = state.workers.get_mut(&chosen) {
                record.queue_length += 1;
            }
        }

        debug!("Dispatching model {} to {}", model_name, chosen);
        Some(chosen)
    }

    /// Aggregate status across all live workers
    pub fn aggregate_status(&self) -> WorkerStatus {
        let state = self.state.lock();
        let models: BTreeSet<&String> = state.model_index.keys().collect();
        WorkerStatus {
            model_names: models.into_iter().cloned().collect(),
            speed: state.workers.values().map(|r| r.speed).sum(),
            queue_length: state.workers.values().map(|r| r.queue_length).sum(),
        }
    }

    /// Snapshot of one record
    pub fn get(&self, address: &str) -> Option<WorkerRecord> {
        self.state.lock().workers.get(address).cloned()
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(DispatchMethod::default())
    }
}
