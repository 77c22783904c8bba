//! Per-interface scheduler state.
//!
//! Everything here lives under the interface's mutex: the priority map, the
//! per-AC admission state, and one [`TidTable`] per TID holding the
//! destination queues together with the round-robin cursor. The scan hint
//! is an atomic kept next to the mutex so the hot enqueue path can raise it
//! and `has_pending` can read it without taking the lock; it is only ever
//! *interpreted* while the lock is held.

use crate::admission::AccessCategoryAdmission;
use crate::frame::MacAddr;
use crate::priority::{PriorityMap, MAX_TIDS, TOP_SLOT};
use crate::queue::{DestinationQueue, PeerCapabilities};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI8, Ordering};

/// Atomic highest-priority-slot hint for the selection scan.
///
/// The hint is a ceiling, never an exact answer: the scan starts at the
/// hinted slot and walks down, so a hint that is too high only costs a few
/// empty-slot probes, while a hint that is too low would starve a TID.
/// Raises therefore happen eagerly (every enqueue) and lowers only happen
/// when a scan has proven the slots above empty.
#[derive(Debug)]
pub struct ScanHint(AtomicI8);

/// Sentinel meaning "nothing queued anywhere".
const HINT_NONE: i8 = -1;

impl Default for ScanHint {
    fn default() -> Self {
        Self(AtomicI8::new(HINT_NONE))
    }
}

impl ScanHint {
    /// Current hint slot, or `None` when nothing is queued.
    pub fn get(&self) -> Option<usize> {
        let v = self.0.load(Ordering::Acquire);
        (v >= 0).then_some(v as usize)
    }

    /// Raise the hint to at least `slot`.
    pub fn raise(&self, slot: usize) {
        self.0.fetch_max(slot as i8, Ordering::AcqRel);
    }

    /// Pin the hint to exactly `slot`.
    pub fn set(&self, slot: usize) {
        self.0.store(slot as i8, Ordering::Release);
    }

    /// Lower the hint to `slot` if it currently sits above it.
    pub fn lower_to(&self, slot: usize) {
        self.0.fetch_min(slot as i8, Ordering::AcqRel);
    }

    /// Clear to the empty sentinel.
    pub fn clear(&self) {
        self.0.store(HINT_NONE, Ordering::Release);
    }
}

/// Destination queues for one TID plus the round-robin service cursor.
#[derive(Debug, Default)]
pub struct TidTable {
    queues: Vec<DestinationQueue>,
    /// Index of the queue served last; the next scan starts after it.
    cursor: Option<usize>,
}

impl TidTable {
    pub fn queues(&self) -> &[DestinationQueue] {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut [DestinationQueue] {
        &mut self.queues
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&DestinationQueue> {
        self.queues.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut DestinationQueue> {
        self.queues.get_mut(idx)
    }

    /// Index of the queue keyed to `dest`, if one exists.
    pub fn position(&self, dest: &MacAddr) -> Option<usize> {
        self.queues.iter().position(|q| q.dest() == *dest)
    }

    pub fn push(&mut self, queue: DestinationQueue) -> usize {
        self.queues.push(queue);
        self.queues.len() - 1
    }

    /// Remove the queue at `idx`, keeping the cursor pointed at the queue
    /// it was pointing at before (or clearing it if that queue is gone).
    pub fn remove(&mut self, idx: usize) -> DestinationQueue {
        let removed = self.queues.remove(idx);
        self.cursor = match self.cursor {
            Some(c) if idx < c => Some(c - 1),
            Some(c) if idx == c => None,
            other => other,
        };
        removed
    }

    /// Next serviceable queue in round-robin order, starting after the
    /// cursor. Paused and empty queues are skipped.
    pub fn next_eligible(&self) -> Option<usize> {
        let n = self.queues.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.map(|c| (c + 1) % n).unwrap_or(0);
        for step in 0..n {
            let idx = (start + step) % n;
            let q = &self.queues[idx];
            if !q.paused() && !q.is_empty() {
                return Some(idx);
            }
        }
        None
    }

    pub fn set_cursor(&mut self, idx: usize) {
        self.cursor = Some(idx);
    }

    /// Frames queued across all destinations, paused included.
    pub fn depth(&self) -> u32 {
        self.queues.iter().map(|q| q.len() as u32).sum()
    }

    /// Frames queued on unpaused destinations only.
    pub fn active_depth(&self) -> u32 {
        self.queues
            .iter()
            .filter(|q| !q.paused())
            .map(|q| q.len() as u32)
            .sum()
    }
}

/// One selection made by the slot scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub tid: usize,
    pub slot: usize,
    pub queue_idx: usize,
}

/// All mutex-protected scheduler state for one interface.
#[derive(Debug)]
pub struct SchedulerState {
    pub map: PriorityMap,
    pub admission: AccessCategoryAdmission,
    tids: [TidTable; MAX_TIDS],
    /// Frames queued per TID, paused destinations included. The sibling
    /// fairness rule reads this, not the unpaused total.
    pkts_queued: [u32; MAX_TIDS],
    /// Registered unicast peers and the capabilities they registered with.
    peers: HashMap<MacAddr, PeerCapabilities>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            map: PriorityMap::default(),
            admission: AccessCategoryAdmission::default(),
            tids: Default::default(),
            pkts_queued: [0; MAX_TIDS],
            peers: HashMap::new(),
        }
    }
}

impl SchedulerState {
    pub fn tid_table(&self, tid: usize) -> &TidTable {
        &self.tids[tid]
    }

    pub fn tid_table_mut(&mut self, tid: usize) -> &mut TidTable {
        &mut self.tids[tid]
    }

    pub fn pkts_queued(&self, tid: usize) -> u32 {
        self.pkts_queued[tid]
    }

    pub fn add_pkts(&mut self, tid: usize, n: u32) {
        self.pkts_queued[tid] += n;
    }

    pub fn sub_pkts(&mut self, tid: usize, n: u32) {
        self.pkts_queued[tid] = self.pkts_queued[tid].saturating_sub(n);
    }

    pub fn peers(&self) -> &HashMap<MacAddr, PeerCapabilities> {
        &self.peers
    }

    pub fn peer_registered(&self, dest: &MacAddr) -> bool {
        self.peers.contains_key(dest)
    }

    pub fn register_peer(&mut self, dest: MacAddr, caps: PeerCapabilities) -> bool {
        self.peers.insert(dest, caps).is_none()
    }

    pub fn forget_peer(&mut self, dest: &MacAddr) -> Option<PeerCapabilities> {
        self.peers.remove(dest)
    }

    pub fn peer_caps(&self, dest: &MacAddr) -> Option<PeerCapabilities> {
        self.peers.get(dest).copied()
    }

    /// Total number of destination queues across all TIDs.
    pub fn queue_count(&self) -> usize {
        self.tids.iter().map(TidTable::len).sum()
    }

    /// Pick the next queue to serve: scan priority slots downward from the
    /// hint, and inside the first slot with serviceable traffic pick the
    /// round-robin-next destination. Returns `None` when nothing anywhere
    /// is serviceable.
    ///
    /// The hint is an optimization only: when the downward scan comes up
    /// empty, the slots above the hint are covered too, so a hint lowered
    /// by the sibling rule can never hide higher-priority traffic.
    ///
    /// Pure peek: the caller advances the chosen TID's cursor once the
    /// frame is actually taken.
    pub fn select(&self, hint: &ScanHint) -> Option<Selection> {
        let start = hint.get()?.min(TOP_SLOT);
        self.scan_slots((0..=start).rev())
            .or_else(|| self.scan_slots((start + 1..=TOP_SLOT).rev()))
    }

    fn scan_slots(&self, slots: impl Iterator<Item = usize>) -> Option<Selection> {
        for slot in slots {
            let tid = self.map.tid_at_slot(slot);
            if self.pkts_queued[tid] == 0 {
                continue;
            }
            if let Some(queue_idx) = self.tids[tid].next_eligible() {
                return Some(Selection {
                    tid,
                    slot,
                    queue_idx,
                });
            }
        }
        None
    }

    /// Sibling-fairness hint update, applied after a slot has been served.
    /// If the served TID's sibling (the other TID of the same AC, sitting on
    /// the adjacent slot) still has frames queued the next scan starts
    /// there, so one TID of a pair cannot monopolise the AC. Otherwise the
    /// hint drops to the served slot.
    pub fn update_hint_after_service(&self, slot: usize, hint: &ScanHint) {
        let sibling = slot ^ 1;
        let sibling_tid = self.map.tid_at_slot(sibling);
        if self.pkts_queued[sibling_tid] > 0 {
            hint.set(sibling);
        } else {
            hint.lower_to(slot);
        }
    }
}
