//! Named priority queues.
//!
//! Each queue runs at most `max_concurrent` runs; within a queue the
//! highest-priority ready item starts first (1 is highest), FIFO within a
//! priority. Pending items wait in a bounded FIFO; overflow is QUEUE_FULL
//! back to the trigger.

use crate::error::{ErrorCode, StepError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-queue configuration (`orchestrator.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_pending: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_pending: 256,
        }
    }
}

/// One queued run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub run_id: i64,
    pub queue: String,
    pub priority: u8,
    /// Arrival order within the scheduler, for FIFO tie-breaks.
    pub seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    running: usize,
}

/// In-memory scheduler over named queues. Thread-safe; workers call
/// [`Scheduler::acquire`] and must pair every item with
/// [`Scheduler::release`].
pub struct Scheduler {
    configs: BTreeMap<String, QueueConfig>,
    default_config: QueueConfig,
    queues: Mutex<BTreeMap<String, QueueState>>,
    seq: AtomicU64,
    depth_peak: AtomicU64,
}

impl Scheduler {
    pub fn new(configs: BTreeMap<String, QueueConfig>) -> Self {
        Self {
            configs,
            default_config: QueueConfig::default(),
            queues: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            depth_peak: AtomicU64::new(0),
        }
    }

    fn config_for(&self, queue: &str) -> &QueueConfig {
        self.configs.get(queue).unwrap_or(&self.default_config)
    }

    /// Enqueue a run. Returns QUEUE_FULL when the queue's pending FIFO is at
    /// capacity.
    pub fn enqueue(&self, queue: &str, run_id: i64, priority: u8) -> Result<(), StepError> {
        let max_pending = self.config_for(queue).max_pending;
        let mut queues = self.lock();
        let state = queues.entry(queue.to_string()).or_default();
        if state.pending.len() >= max_pending {
            return Err(StepError::new(
                ErrorCode::QueueFull,
                format!("queue '{queue}' has {} pending items", state.pending.len()),
            ));
        }
        state.pending.push_back(QueueItem {
            run_id,
            queue: queue.to_string(),
            priority: priority.clamp(1, 9),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        let depth: usize = queues.values().map(|q| q.pending.len()).sum();
        self.depth_peak.fetch_max(depth as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Take the next ready item across all queues, if any queue has spare
    /// concurrency. The caller owns the returned item until `release`.
    pub fn acquire(&self) -> Option<QueueItem> {
        let mut queues = self.lock();
        // Candidate per queue: best (priority, seq); then best across queues.
        let mut best: Option<(String, u8, u64)> = None;
        for (name, state) in queues.iter() {
            if state.running >= self.config_for(name).max_concurrent {
                continue;
            }
            if let Some((priority, seq)) = state
                .pending
                .iter()
                .map(|item| (item.priority, item.seq))
                .min()
            {
                let better = match &best {
                    None => true,
                    Some((_, bp, bs)) => (priority, seq) < (*bp, *bs),
                };
                if better {
                    best = Some((name.clone(), priority, seq));
                }
            }
        }
        let (name, _, seq) = best?;
        let state = queues.get_mut(&name)?;
        let pos = state.pending.iter().position(|item| item.seq == seq)?;
        let item = state.pending.remove(pos)?;
        state.running += 1;
        Some(item)
    }

    /// Return a slot to the queue after the run completes or suspends.
    pub fn release(&self, queue: &str) {
        let mut queues = self.lock();
        if let Some(state) = queues.get_mut(queue) {
            state.running = state.running.saturating_sub(1);
        }
    }

    /// Total pending items across queues.
    pub fn depth(&self) -> usize {
        self.lock().values().map(|q| q.pending.len()).sum()
    }

    /// Highest total depth observed since startup.
    pub fn depth_peak(&self) -> u64 {
        self.depth_peak.load(Ordering::Relaxed)
    }

    pub fn running(&self, queue: &str) -> usize {
        self.lock().get(queue).map(|q| q.running).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}
