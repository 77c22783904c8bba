//! Counters and serializable state snapshots.
//!
//! Each interface carries an [`InterfaceCounters`] block of lock-free
//! counters updated on the hot paths;
//! [`Scheduler::snapshot`](crate::scheduler::Scheduler::snapshot) folds
//! them together with the locked queue state into plain
//! [`serde::Serialize`] structs for diagnostics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-interface event counters.
#[derive(Debug, Default)]
pub struct InterfaceCounters {
    pub enqueued: AtomicU64,
    pub transmitted: AtomicU64,
    pub dropped: AtomicU64,
    pub requeued: AtomicU64,
    pub queue_rejects: AtomicU64,
    pub backpressure_events: AtomicU64,
}

impl InterfaceCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            queue_rejects: self.queue_rejects.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub enqueued: u64,
    pub transmitted: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub queue_rejects: u64,
    pub backpressure_events: u64,
}

/// State of one destination queue at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub tid: usize,
    pub dest: String,
    pub depth: usize,
    /// Queue delay of the head frame in 2 ms units, capped at the
    /// configured `queue_delay_cap`. `None` for an empty queue.
    pub head_delay_units: Option<u8>,
    pub paused: bool,
    pub stream: &'static str,
    pub transmitted: u64,
    pub requeues: u64,
    pub consecutive_count: u32,
    pub admission_threshold: u32,
}

/// Full per-interface snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceSnapshot {
    pub interface: usize,
    pub port_open: bool,
    pub total_queued: u32,
    pub backpressure_applied: bool,
    pub counters: CounterSnapshot,
    pub queues: Vec<QueueSnapshot>,
}
