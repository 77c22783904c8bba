//! The transmit scheduler.
//!
//! One [`Scheduler`] serves a fixed set of interfaces. Each interface owns
//! a mutex over its [`SchedulerState`]; the atomic queued-total, scan hint
//! and port flag sit outside the mutex so the producer-facing paths can
//! consult them cheaply. A drain step picks one interface (round-robin via
//! [`InterfaceGroup`]), selects the highest-priority serviceable queue,
//! dequeues one frame and hands it to the [`TransmitPath`] with the lock
//! released. Because the lock is dropped around the transmit call, every
//! post-transmit touch of the queue revalidates it by generation first;
//! a queue removed in the window simply fails the check and the frame is
//! handled as permanently undeliverable.

use crate::admission::AcStatus;
use crate::config::SchedulerConfig;
use crate::frame::{fmt_mac, is_group_addr, Frame, MacAddr, BROADCAST_ADDR};
use crate::group::InterfaceGroup;
use crate::interface::{AdmissionControl, BackpressureSink, FrameSink, TransmitPath, TxOutcome};
use crate::priority::{rank_by_backoff, AcChannelParams, AccessCategory, MAX_TIDS, TOP_SLOT};
use crate::queue::{DestinationQueue, PeerCapabilities, StreamState};
use crate::state::{ScanHint, SchedulerState};
use crate::stats::{InterfaceCounters, InterfaceSnapshot, QueueSnapshot};

use anyhow::{bail, Context, Result};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Outcome of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// One frame was handed to the transmit path.
    Sent,
    /// The transmit path reported transient exhaustion; the frame is back
    /// at the head of its queue and the caller should yield before retrying.
    Retry,
    /// A frame was permanently dropped (transmit failure or its queue
    /// vanished during the transmit window).
    Dropped,
    /// Nothing serviceable on any interface.
    Idle,
}

/// What the next drain step would serve, without dequeuing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pick {
    pub tid: usize,
    pub slot: usize,
    pub dest: MacAddr,
}

struct Interface {
    id: usize,
    state: Mutex<SchedulerState>,
    hint: ScanHint,
    /// Frames queued on unpaused destinations. Readable without the mutex;
    /// only mutated while it is held.
    total_queued: AtomicU32,
    /// Watermark hysteresis latch. Held across the [`BackpressureSink`]
    /// call so apply/release notifications are delivered in latch order
    /// even when producer and drain threads race past a crossing.
    bp_latch: Mutex<bool>,
    port_open: AtomicBool,
    counters: InterfaceCounters,
}

pub struct Scheduler {
    interfaces: Vec<Interface>,
    group: Mutex<InterfaceGroup>,
    tx: Arc<dyn TransmitPath>,
    admission_ctl: Arc<dyn AdmissionControl>,
    backpressure: Arc<dyn BackpressureSink>,
    frames: Arc<dyn FrameSink>,
    rng: Mutex<SmallRng>,
    generations: AtomicU64,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        tx: Arc<dyn TransmitPath>,
        admission_ctl: Arc<dyn AdmissionControl>,
        backpressure: Arc<dyn BackpressureSink>,
        frames: Arc<dyn FrameSink>,
    ) -> Self {
        Self::with_rng(
            config,
            tx,
            admission_ctl,
            backpressure,
            frames,
            SmallRng::try_from_rng(&mut rand::rngs::SysRng)
                .expect("unexpected failure from SysRng"),
        )
    }

    /// Deterministic construction for tests.
    pub fn with_rng_seed(
        config: SchedulerConfig,
        seed: u64,
        tx: Arc<dyn TransmitPath>,
        admission_ctl: Arc<dyn AdmissionControl>,
        backpressure: Arc<dyn BackpressureSink>,
        frames: Arc<dyn FrameSink>,
    ) -> Self {
        Self::with_rng(
            config,
            tx,
            admission_ctl,
            backpressure,
            frames,
            SmallRng::seed_from_u64(seed),
        )
    }

    fn with_rng(
        config: SchedulerConfig,
        tx: Arc<dyn TransmitPath>,
        admission_ctl: Arc<dyn AdmissionControl>,
        backpressure: Arc<dyn BackpressureSink>,
        frames: Arc<dyn FrameSink>,
        rng: SmallRng,
    ) -> Self {
        let interfaces = (0..config.interfaces)
            .map(|id| Interface {
                id,
                state: Mutex::new(SchedulerState::default()),
                hint: ScanHint::default(),
                total_queued: AtomicU32::new(0),
                bp_latch: Mutex::new(false),
                port_open: AtomicBool::new(false),
                counters: InterfaceCounters::default(),
            })
            .collect();
        Self {
            group: Mutex::new(InterfaceGroup::new(config.interfaces)),
            interfaces,
            tx,
            admission_ctl,
            backpressure,
            frames,
            rng: Mutex::new(rng),
            generations: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn iface(&self, interface: usize) -> Result<&Interface> {
        self.interfaces
            .get(interface)
            .with_context(|| format!("no interface {}", interface))
    }

    // ---- enqueue ----------------------------------------------------------

    /// Queue a frame for transmission. Returns false and invokes
    /// [`FrameSink::on_queue_failure`] when the frame cannot be accepted
    /// (unknown interface, unregistered unicast peer, queue table full).
    pub fn enqueue(&self, interface: usize, dest: MacAddr, mut frame: Frame) -> bool {
        let Some(iface) = self.interfaces.get(interface) else {
            warn!(interface, "enqueue on unknown interface");
            self.frames.on_queue_failure(frame);
            return false;
        };
        let dest = if is_group_addr(&dest) {
            BROADCAST_ADDR
        } else {
            dest
        };

        let mut state = iface.state.lock().unwrap();
        let tid = state
            .admission
            .downgrade_tid(state.map.classify(frame.priority as u32));

        let caps = if dest == BROADCAST_ADDR {
            PeerCapabilities::default()
        } else if let Some(caps) = state.peer_caps(&dest) {
            caps
        } else if self.config.peer_gated {
            drop(state);
            InterfaceCounters::incr(&iface.counters.queue_rejects);
            warn!(
                interface,
                dest = %fmt_mac(&dest),
                "frame for unregistered peer rejected"
            );
            self.frames.on_queue_failure(frame);
            return false;
        } else {
            PeerCapabilities::default()
        };

        let idx = match state.tid_table(tid).position(&dest) {
            Some(idx) => idx,
            None => {
                if state.tid_table(tid).len() >= self.config.max_destinations_per_tid {
                    drop(state);
                    InterfaceCounters::incr(&iface.counters.queue_rejects);
                    warn!(interface, tid, dest = %fmt_mac(&dest), "queue table full");
                    self.frames.on_queue_failure(frame);
                    return false;
                }
                let queue = {
                    let mut rng = self.rng.lock().unwrap();
                    DestinationQueue::new(
                        dest,
                        tid,
                        self.generations.fetch_add(1, Ordering::Relaxed),
                        &caps,
                        &mut *rng,
                        self.config.admission_threshold_offset,
                        self.config.admission_threshold_window,
                    )
                };
                debug!(interface, tid, dest = %fmt_mac(&dest), "destination queue created");
                state.tid_table_mut(tid).push(queue)
            }
        };

        frame.stamp_enqueued();
        let paused = {
            let Some(queue) = state.tid_table_mut(tid).get_mut(idx) else {
                drop(state);
                self.frames.on_queue_failure(frame);
                return false;
            };
            queue.enqueue(frame);
            queue.paused()
        };
        state.add_pkts(tid, 1);
        InterfaceCounters::incr(&iface.counters.enqueued);

        if !paused {
            iface.total_queued.fetch_add(1, Ordering::Relaxed);
            iface.hint.raise(state.map.slot_of(tid));
        }
        drop(state);
        if !paused {
            self.sync_backpressure(iface);
        }
        true
    }

    // ---- drain ------------------------------------------------------------

    /// Serve one frame from the round-robin-next interface with traffic.
    pub fn drain_step(&self) -> DrainStatus {
        let order: Vec<usize> = self.group.lock().unwrap().order().collect();
        for id in order {
            let iface = &self.interfaces[id];
            if !iface.port_open.load(Ordering::Acquire)
                || iface.total_queued.load(Ordering::Acquire) == 0
            {
                continue;
            }
            if let Some(status) = self.drain_interface_once(iface) {
                self.group.lock().unwrap().served(id);
                return status;
            }
        }
        DrainStatus::Idle
    }

    /// Drain until the transmit path pushes back or nothing is left.
    /// Returns the number of frames handed off.
    pub fn drain(&self) -> u64 {
        let mut sent = 0;
        loop {
            match self.drain_step() {
                DrainStatus::Sent => sent += 1,
                DrainStatus::Dropped => {}
                DrainStatus::Retry | DrainStatus::Idle => break,
            }
        }
        sent
    }

    fn drain_interface_once(&self, iface: &Interface) -> Option<DrainStatus> {
        let mut state = iface.state.lock().unwrap();
        let Some(sel) = state.select(&iface.hint) else {
            // The full scan found nothing serviceable; park the hint at the
            // empty sentinel so later scans short-circuit. Any enqueue,
            // resume or requeue raises it again, and all of those happen
            // under this lock.
            iface.hint.clear();
            return None;
        };
        let (frame, next_len, dest, generation, pursue) = {
            let queue = state.tid_table_mut(sel.tid).get_mut(sel.queue_idx)?;
            let frame = queue.dequeue_front()?;
            let pursue = !frame.was_requeued()
                && queue.aggregation_enabled()
                && queue.stream() == StreamState::None
                && queue.admission_due()
                && !is_group_addr(&queue.dest());
            (
                frame,
                queue.next_frame_len(),
                queue.dest(),
                queue.generation(),
                pursue,
            )
        };
        state.tid_table_mut(sel.tid).set_cursor(sel.queue_idx);
        state.sub_pkts(sel.tid, 1);
        iface.total_queued.fetch_sub(1, Ordering::Release);
        state.update_hint_after_service(sel.slot, &iface.hint);
        drop(state);
        self.sync_backpressure(iface);

        // Lock released for the transmit call; everything after this point
        // revalidates the queue by generation before touching it.
        let outcome = self.tx.transmit(&frame, next_len);

        match outcome {
            TxOutcome::Sent => {
                InterfaceCounters::incr(&iface.counters.transmitted);
                let pursue_now = {
                    let mut state = iface.state.lock().unwrap();
                    match Self::queue_mut(&mut state, sel.tid, &dest, generation) {
                        Some(queue) => {
                            queue.record_transmitted();
                            if pursue && queue.stream() == StreamState::None {
                                queue.begin_stream_setup();
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                };
                if pursue_now {
                    self.pursue_stream(iface, sel.tid, dest, generation);
                }
                Some(DrainStatus::Sent)
            }
            TxOutcome::Busy => {
                let mut leftover = Some(frame);
                let requeued = {
                    let mut state = iface.state.lock().unwrap();
                    let paused =
                        Self::queue_mut(&mut state, sel.tid, &dest, generation).map(|queue| {
                            if let Some(frame) = leftover.take() {
                                queue.requeue_front(frame);
                            }
                            queue.paused()
                        });
                    if let Some(paused) = paused {
                        state.add_pkts(sel.tid, 1);
                        if !paused {
                            iface.total_queued.fetch_add(1, Ordering::Release);
                            iface.hint.raise(state.map.slot_of(sel.tid));
                        }
                        InterfaceCounters::incr(&iface.counters.requeued);
                        true
                    } else {
                        false
                    }
                };
                self.sync_backpressure(iface);
                if requeued {
                    Some(DrainStatus::Retry)
                } else if let Some(frame) = leftover {
                    // Queue vanished during the transmit window.
                    debug!(
                        interface = iface.id,
                        tid = sel.tid,
                        dest = %fmt_mac(&dest),
                        "queue removed while frame was in flight, dropping"
                    );
                    InterfaceCounters::incr(&iface.counters.dropped);
                    self.frames.on_permanent_failure(frame);
                    Some(DrainStatus::Dropped)
                } else {
                    Some(DrainStatus::Retry)
                }
            }
            TxOutcome::Failed => {
                warn!(
                    interface = iface.id,
                    tid = sel.tid,
                    dest = %fmt_mac(&dest),
                    "transmit failed, dropping frame"
                );
                InterfaceCounters::incr(&iface.counters.dropped);
                self.frames.on_permanent_failure(frame);
                Some(DrainStatus::Dropped)
            }
        }
    }

    /// What the next drain step on `interface` would serve. Pure peek: the
    /// round-robin cursors do not move.
    pub fn pick_next(&self, interface: usize) -> Result<Option<Pick>> {
        let iface = self.iface(interface)?;
        let state = iface.state.lock().unwrap();
        let pick = state.select(&iface.hint).and_then(|sel| {
            state.tid_table(sel.tid).get(sel.queue_idx).map(|q| Pick {
                tid: sel.tid,
                slot: sel.slot,
                dest: q.dest(),
            })
        });
        Ok(pick)
    }

    // ---- aggregation streams ----------------------------------------------

    fn pursue_stream(&self, iface: &Interface, tid: usize, dest: MacAddr, generation: u64) {
        let result = if self.admission_ctl.stream_capacity_available() {
            self.admission_ctl.request_stream_setup(tid, dest)
        } else if let Some((retire_tid, retire_dest)) =
            self.admission_ctl.find_stream_to_retire(tid, dest)
        {
            debug!(
                interface = iface.id,
                retire_tid,
                retire_dest = %fmt_mac(&retire_dest),
                "retiring stream to make room"
            );
            self.admission_ctl
                .request_stream_teardown(retire_tid, retire_dest)
                .and_then(|_| self.admission_ctl.request_stream_setup(tid, dest))
        } else {
            debug!(
                interface = iface.id,
                tid,
                dest = %fmt_mac(&dest),
                "no stream capacity and nothing to retire, setup abandoned"
            );
            self.reset_stream(iface, tid, &dest, generation);
            return;
        };
        if let Err(err) = result {
            warn!(
                interface = iface.id,
                tid,
                dest = %fmt_mac(&dest),
                error = %err,
                "stream setup request failed"
            );
            self.reset_stream(iface, tid, &dest, generation);
        }
    }

    fn reset_stream(&self, iface: &Interface, tid: usize, dest: &MacAddr, generation: u64) {
        let mut state = iface.state.lock().unwrap();
        if let Some(queue) = Self::queue_mut(&mut state, tid, dest, generation) {
            queue.set_stream(StreamState::None);
        }
    }

    /// The peer accepted the stream for (tid, dest).
    pub fn stream_established(&self, interface: usize, tid: usize, dest: MacAddr) -> Result<bool> {
        self.set_stream_state(interface, tid, dest, StreamState::Established)
    }

    /// The peer rejected the stream request; the queue goes back to plain
    /// delivery and may retry once enough new traffic accumulates.
    pub fn stream_rejected(&self, interface: usize, tid: usize, dest: MacAddr) -> Result<bool> {
        self.set_stream_state(interface, tid, dest, StreamState::None)
    }

    /// An established stream was torn down (by either side).
    pub fn stream_torn_down(&self, interface: usize, tid: usize, dest: MacAddr) -> Result<bool> {
        self.set_stream_state(interface, tid, dest, StreamState::None)
    }

    fn set_stream_state(
        &self,
        interface: usize,
        tid: usize,
        dest: MacAddr,
        new: StreamState,
    ) -> Result<bool> {
        if tid >= MAX_TIDS {
            bail!("tid {} out of range", tid);
        }
        let iface = self.iface(interface)?;
        let mut state = iface.state.lock().unwrap();
        let table = state.tid_table_mut(tid);
        let found = match table.position(&dest).and_then(|idx| table.get_mut(idx)) {
            Some(queue) => {
                queue.set_stream(new);
                true
            }
            None => false,
        };
        drop(state);
        debug!(
            interface,
            tid,
            dest = %fmt_mac(&dest),
            state = new.as_str(),
            found,
            "stream state update"
        );
        Ok(found)
    }

    // ---- peers ------------------------------------------------------------

    /// Register a unicast peer, eagerly creating its queue on every TID.
    /// Returns false when the peer was already registered.
    pub fn register_peer(
        &self,
        interface: usize,
        dest: MacAddr,
        caps: PeerCapabilities,
    ) -> Result<bool> {
        if is_group_addr(&dest) {
            bail!("cannot register a group address as a peer");
        }
        let iface = self.iface(interface)?;
        let mut state = iface.state.lock().unwrap();
        if state.peer_registered(&dest) {
            return Ok(false);
        }
        for tid in 0..MAX_TIDS {
            let table = state.tid_table(tid);
            if table.position(&dest).is_none()
                && table.len() >= self.config.max_destinations_per_tid
            {
                bail!("queue table for tid {} is full", tid);
            }
        }
        state.register_peer(dest, caps);
        let mut rng = self.rng.lock().unwrap();
        for tid in 0..MAX_TIDS {
            if state.tid_table(tid).position(&dest).is_none() {
                let queue = DestinationQueue::new(
                    dest,
                    tid,
                    self.generations.fetch_add(1, Ordering::Relaxed),
                    &caps,
                    &mut *rng,
                    self.config.admission_threshold_offset,
                    self.config.admission_threshold_window,
                );
                state.tid_table_mut(tid).push(queue);
            }
        }
        drop(rng);
        drop(state);
        debug!(interface, dest = %fmt_mac(&dest), "peer registered");
        Ok(true)
    }

    /// Remove a peer and drop everything still queued for it. Each dropped
    /// frame is reported through [`FrameSink::on_permanent_failure`].
    /// Returns the number of frames dropped.
    pub fn remove_peer(&self, interface: usize, dest: MacAddr) -> Result<usize> {
        let iface = self.iface(interface)?;
        let mut dropped: Vec<Frame> = Vec::new();
        {
            let mut state = iface.state.lock().unwrap();
            state.forget_peer(&dest);
            for tid in 0..MAX_TIDS {
                if let Some(idx) = state.tid_table(tid).position(&dest) {
                    let mut queue = state.tid_table_mut(tid).remove(idx);
                    let depth = queue.len() as u32;
                    state.sub_pkts(tid, depth);
                    if !queue.paused() {
                        iface.total_queued.fetch_sub(depth, Ordering::Release);
                    }
                    dropped.extend(queue.drain_all());
                }
            }
            // Slot occupancy changed wholesale; rescan from the top.
            if iface.total_queued.load(Ordering::Acquire) > 0 {
                iface.hint.set(TOP_SLOT);
            } else {
                iface.hint.clear();
            }
        }
        self.sync_backpressure(iface);
        let count = dropped.len();
        for frame in dropped {
            InterfaceCounters::incr(&iface.counters.dropped);
            self.frames.on_permanent_failure(frame);
        }
        debug!(interface, dest = %fmt_mac(&dest), frames = count, "peer removed");
        Ok(count)
    }

    /// Move a peer's queues to a new address (the peer re-associated under
    /// a different MAC). Thresholds re-randomize and any stream state is
    /// discarded. Returns the number of queues moved.
    pub fn rekey_peer(&self, interface: usize, old: MacAddr, new: MacAddr) -> Result<usize> {
        if is_group_addr(&new) {
            bail!("cannot rekey a peer to a group address");
        }
        let iface = self.iface(interface)?;
        let mut state = iface.state.lock().unwrap();
        let caps = state
            .forget_peer(&old)
            .with_context(|| format!("peer {} not registered", fmt_mac(&old)))?;
        if state.peer_registered(&new) {
            bail!("peer {} already registered", fmt_mac(&new));
        }
        state.register_peer(new, caps);
        let mut rng = self.rng.lock().unwrap();
        let mut moved = 0;
        for tid in 0..MAX_TIDS {
            let table = state.tid_table_mut(tid);
            if let Some(queue) = table.position(&old).and_then(|idx| table.get_mut(idx)) {
                queue.rekey(
                    new,
                    &mut *rng,
                    self.config.admission_threshold_offset,
                    self.config.admission_threshold_window,
                );
                moved += 1;
            }
        }
        drop(rng);
        drop(state);
        debug!(
            interface,
            old = %fmt_mac(&old),
            new = %fmt_mac(&new),
            queues = moved,
            "peer rekeyed"
        );
        Ok(moved)
    }

    /// Pause or resume every queue of `dest` on `interface`. Idempotent:
    /// queues already in the requested state contribute nothing to the
    /// watermark accounting. Returns the number of frames whose
    /// serviceability changed.
    pub fn pause_peer(&self, interface: usize, dest: MacAddr, paused: bool) -> Result<u32> {
        let iface = self.iface(interface)?;
        let mut delta = 0u32;
        {
            let mut state = iface.state.lock().unwrap();
            let mut touched_tids = Vec::new();
            for tid in 0..MAX_TIDS {
                let table = state.tid_table_mut(tid);
                if let Some(queue) = table.position(&dest).and_then(|idx| table.get_mut(idx)) {
                    if queue.paused() != paused {
                        queue.set_paused(paused);
                        delta += queue.len() as u32;
                        touched_tids.push(tid);
                    }
                }
            }
            if delta > 0 {
                if paused {
                    iface.total_queued.fetch_sub(delta, Ordering::Release);
                } else {
                    iface.total_queued.fetch_add(delta, Ordering::Release);
                    for tid in touched_tids {
                        iface.hint.raise(state.map.slot_of(tid));
                    }
                }
            }
        }
        self.sync_backpressure(iface);
        debug!(interface, dest = %fmt_mac(&dest), paused, frames = delta, "peer pause state");
        Ok(delta)
    }

    // ---- priorities and admission -----------------------------------------

    /// Apply a new per-AC status (enable/admission) on one interface.
    pub fn ac_status_update(
        &self,
        interface: usize,
        ac: AccessCategory,
        status: AcStatus,
    ) -> Result<()> {
        let iface = self.iface(interface)?;
        let mut state = iface.state.lock().unwrap();
        state.admission.update(ac, status);
        Ok(())
    }

    /// Re-rank the four ACs from advertised channel parameters and rebuild
    /// the slot table accordingly.
    pub fn reconfigure_priorities(
        &self,
        interface: usize,
        params: &[AcChannelParams; 4],
    ) -> Result<()> {
        let iface = self.iface(interface)?;
        let ranking = rank_by_backoff(params);
        let mut state = iface.state.lock().unwrap();
        state.map.reconfigure(ranking);
        // TIDs moved between slots; any cached hint is stale.
        if iface.total_queued.load(Ordering::Acquire) > 0 {
            iface.hint.set(TOP_SLOT);
        }
        drop(state);
        debug!(
            interface,
            ranking = ?ranking.map(|ac| ac.as_str()),
            "priority slots reconfigured"
        );
        Ok(())
    }

    /// Restore the default VO > VI > BE > BK slot layout.
    pub fn reset_priorities(&self, interface: usize) -> Result<()> {
        let iface = self.iface(interface)?;
        let mut state = iface.state.lock().unwrap();
        state.map.reset();
        if iface.total_queued.load(Ordering::Acquire) > 0 {
            iface.hint.set(TOP_SLOT);
        }
        Ok(())
    }

    // ---- interface lifecycle ----------------------------------------------

    /// Open or close an interface's transmit port. Frames may be queued
    /// while the port is closed; they drain once it opens.
    pub fn set_port_open(&self, interface: usize, open: bool) -> Result<()> {
        let iface = self.iface(interface)?;
        iface.port_open.store(open, Ordering::Release);
        debug!(interface, open, "port state");
        Ok(())
    }

    /// Whether any open interface has serviceable traffic. Lock-free; a
    /// cheap poll for drain-loop wakeups.
    pub fn has_pending(&self) -> bool {
        self.interfaces.iter().any(|iface| {
            iface.port_open.load(Ordering::Acquire)
                && iface.total_queued.load(Ordering::Acquire) > 0
        })
    }

    /// Drop everything queued on an interface and restore the default
    /// priority-slot layout. Peers stay registered and their (now empty)
    /// queues remain. Returns the number of frames dropped.
    pub fn flush_interface(&self, interface: usize) -> Result<usize> {
        let iface = self.iface(interface)?;
        let mut dropped: Vec<Frame> = Vec::new();
        {
            let mut state = iface.state.lock().unwrap();
            for tid in 0..MAX_TIDS {
                let mut drained = 0u32;
                for queue in state.tid_table_mut(tid).queues_mut() {
                    drained += queue.len() as u32;
                    dropped.extend(queue.drain_all());
                }
                state.sub_pkts(tid, drained);
            }
            state.map.reset();
            iface.total_queued.store(0, Ordering::Release);
            iface.hint.clear();
        }
        self.sync_backpressure(iface);
        let count = dropped.len();
        for frame in dropped {
            InterfaceCounters::incr(&iface.counters.dropped);
            self.frames.on_permanent_failure(frame);
        }
        debug!(interface, frames = count, "interface flushed");
        Ok(count)
    }

    // ---- diagnostics ------------------------------------------------------

    pub fn snapshot(&self, interface: usize) -> Result<InterfaceSnapshot> {
        let iface = self.iface(interface)?;
        let state = iface.state.lock().unwrap();
        let mut queues = Vec::with_capacity(state.queue_count());
        for tid in 0..MAX_TIDS {
            for queue in state.tid_table(tid).queues() {
                queues.push(QueueSnapshot {
                    tid,
                    dest: fmt_mac(&queue.dest()),
                    depth: queue.len(),
                    head_delay_units: queue.head_delay_units(self.config.queue_delay_cap),
                    paused: queue.paused(),
                    stream: queue.stream().as_str(),
                    transmitted: queue.transmitted(),
                    requeues: queue.requeues(),
                    consecutive_count: queue.consecutive_count(),
                    admission_threshold: queue.admission_threshold(),
                });
            }
        }
        Ok(InterfaceSnapshot {
            interface: iface.id,
            port_open: iface.port_open.load(Ordering::Acquire),
            total_queued: iface.total_queued.load(Ordering::Acquire),
            backpressure_applied: *iface.bp_latch.lock().unwrap(),
            counters: iface.counters.snapshot(),
            queues,
        })
    }

    /// Unpaused frames queued on one interface.
    pub fn queued_total(&self, interface: usize) -> Result<u32> {
        Ok(self.iface(interface)?.total_queued.load(Ordering::Acquire))
    }

    // ---- internals --------------------------------------------------------

    fn queue_mut<'a>(
        state: &'a mut SchedulerState,
        tid: usize,
        dest: &MacAddr,
        generation: u64,
    ) -> Option<&'a mut DestinationQueue> {
        let table = state.tid_table_mut(tid);
        let idx = table.position(dest)?;
        table.get_mut(idx).filter(|q| q.generation() == generation)
    }

    /// Watermark hysteresis. Called after the state lock is released, on
    /// every path that changed the unpaused total. The latch mutex stays
    /// held across the sink call so a producer that crossed the upper
    /// watermark and a drainer that immediately crossed the lower one
    /// cannot deliver their transitions out of order.
    fn sync_backpressure(&self, iface: &Interface) {
        let mut latched = iface.bp_latch.lock().unwrap();
        let total = iface.total_queued.load(Ordering::Acquire);
        let apply = if !*latched && total >= self.config.upper_watermark {
            *latched = true;
            true
        } else if *latched && total <= self.config.lower_watermark {
            *latched = false;
            false
        } else {
            return;
        };
        InterfaceCounters::incr(&iface.counters.backpressure_events);
        debug!(interface = iface.id, apply, "backpressure transition");
        self.backpressure.on_backpressure(iface.id, apply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::time::Duration;

    const PEER_A: MacAddr = [0x02, 0, 0, 0, 0, 0xaa];
    const PEER_B: MacAddr = [0x02, 0, 0, 0, 0, 0xbb];

    #[derive(Default)]
    struct MockTx {
        outcomes: Mutex<VecDeque<TxOutcome>>,
        sent: Mutex<Vec<(u8, Option<usize>)>>,
    }

    impl MockTx {
        fn push_outcomes(&self, outcomes: &[TxOutcome]) {
            self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
        }

        fn priorities(&self) -> Vec<u8> {
            self.sent.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }
    }

    impl TransmitPath for MockTx {
        fn transmit(&self, frame: &Frame, next_frame_len: Option<usize>) -> TxOutcome {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(TxOutcome::Sent);
            if outcome == TxOutcome::Sent {
                self.sent
                    .lock()
                    .unwrap()
                    .push((frame.priority, next_frame_len));
            }
            outcome
        }
    }

    #[derive(Default)]
    struct MockAdmission {
        capacity: AtomicBool,
        retire: Mutex<Option<(usize, MacAddr)>>,
        setups: Mutex<Vec<(usize, MacAddr)>>,
        teardowns: Mutex<Vec<(usize, MacAddr)>>,
    }

    impl AdmissionControl for MockAdmission {
        fn stream_capacity_available(&self) -> bool {
            self.capacity.load(Ordering::Relaxed)
        }

        fn request_stream_setup(&self, tid: usize, dest: MacAddr) -> Result<()> {
            self.setups.lock().unwrap().push((tid, dest));
            Ok(())
        }

        fn request_stream_teardown(&self, tid: usize, dest: MacAddr) -> Result<()> {
            self.teardowns.lock().unwrap().push((tid, dest));
            Ok(())
        }

        fn find_stream_to_retire(&self, _tid: usize, _dest: MacAddr) -> Option<(usize, MacAddr)> {
            *self.retire.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct MockBackpressure {
        events: Mutex<Vec<(usize, bool)>>,
    }

    impl BackpressureSink for MockBackpressure {
        fn on_backpressure(&self, interface: usize, apply: bool) {
            self.events.lock().unwrap().push((interface, apply));
        }
    }

    #[derive(Default)]
    struct MockSink {
        queue_failures: Mutex<Vec<Frame>>,
        permanent: Mutex<Vec<Frame>>,
    }

    impl FrameSink for MockSink {
        fn on_queue_failure(&self, frame: Frame) {
            self.queue_failures.lock().unwrap().push(frame);
        }

        fn on_permanent_failure(&self, frame: Frame) {
            self.permanent.lock().unwrap().push(frame);
        }
    }

    struct Harness {
        scheduler: Scheduler,
        tx: Arc<MockTx>,
        admission: Arc<MockAdmission>,
        backpressure: Arc<MockBackpressure>,
        sink: Arc<MockSink>,
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            interfaces: 1,
            upper_watermark: 5,
            lower_watermark: 3,
            admission_threshold_offset: 2,
            admission_threshold_window: 1,
            max_destinations_per_tid: 4,
            peer_gated: true,
            queue_delay_cap: Duration::from_millis(510),
        }
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let tx = Arc::new(MockTx::default());
        let admission = Arc::new(MockAdmission::default());
        let backpressure = Arc::new(MockBackpressure::default());
        let sink = Arc::new(MockSink::default());
        let scheduler = Scheduler::with_rng_seed(
            config,
            42,
            tx.clone(),
            admission.clone(),
            backpressure.clone(),
            sink.clone(),
        );
        Harness {
            scheduler,
            tx,
            admission,
            backpressure,
            sink,
        }
    }

    fn frame(priority: u8) -> Frame {
        Frame::new(Bytes::from_static(b"payload"), priority)
    }

    fn open_with_peer(h: &Harness) {
        h.scheduler.set_port_open(0, true).unwrap();
        h.scheduler
            .register_peer(0, PEER_A, PeerCapabilities::default())
            .unwrap();
    }

    #[test]
    fn higher_priority_tid_drains_first() {
        let h = harness(test_config());
        open_with_peer(&h);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(1)));
        assert!(h.scheduler.enqueue(0, PEER_A, frame(6)));
        assert_eq!(h.scheduler.drain(), 2);
        assert_eq!(h.tx.priorities(), vec![6, 1]);
    }

    #[test]
    fn sibling_tids_alternate() {
        let h = harness(test_config());
        open_with_peer(&h);
        for _ in 0..2 {
            assert!(h.scheduler.enqueue(0, PEER_A, frame(7)));
            assert!(h.scheduler.enqueue(0, PEER_A, frame(6)));
        }
        assert_eq!(h.scheduler.drain(), 4);
        assert_eq!(h.tx.priorities(), vec![7, 6, 7, 6]);
    }

    #[test]
    fn destinations_round_robin_within_tid() {
        let h = harness(test_config());
        open_with_peer(&h);
        h.scheduler
            .register_peer(0, PEER_B, PeerCapabilities::default())
            .unwrap();
        for _ in 0..2 {
            assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
            assert!(h.scheduler.enqueue(0, PEER_B, frame(0)));
        }
        let mut dests = Vec::new();
        while let Some(pick) = h.scheduler.pick_next(0).unwrap() {
            dests.push(pick.dest);
            assert_eq!(h.scheduler.drain_step(), DrainStatus::Sent);
        }
        assert_eq!(dests, vec![PEER_A, PEER_B, PEER_A, PEER_B]);
    }

    #[test]
    fn unregistered_unicast_rejected_when_gated() {
        let h = harness(test_config());
        h.scheduler.set_port_open(0, true).unwrap();
        assert!(!h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert_eq!(h.sink.queue_failures.lock().unwrap().len(), 1);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 0);
    }

    #[test]
    fn group_traffic_collapses_onto_broadcast_queue() {
        let h = harness(test_config());
        h.scheduler.set_port_open(0, true).unwrap();
        assert!(h.scheduler.enqueue(0, BROADCAST_ADDR, frame(0)));
        assert!(h.scheduler.enqueue(0, [0x01, 0, 0x5e, 0, 0, 1], frame(0)));
        let snap = h.scheduler.snapshot(0).unwrap();
        assert_eq!(snap.queues.len(), 1);
        assert_eq!(snap.queues[0].dest, "ff:ff:ff:ff:ff:ff");
        assert_eq!(snap.queues[0].depth, 2);
    }

    #[test]
    fn busy_outcome_requeues_at_head() {
        let h = harness(test_config());
        open_with_peer(&h);
        h.tx.push_outcomes(&[TxOutcome::Busy]);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(3)));
        assert_eq!(h.scheduler.drain_step(), DrainStatus::Retry);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 1);
        // Next attempt succeeds and nothing was lost or reordered.
        assert_eq!(h.scheduler.drain_step(), DrainStatus::Sent);
        assert_eq!(h.tx.priorities(), vec![3]);
        assert!(h.sink.permanent.lock().unwrap().is_empty());
        let snap = h.scheduler.snapshot(0).unwrap();
        assert_eq!(snap.counters.requeued, 1);
    }

    #[test]
    fn failed_outcome_drops_and_notifies_once() {
        let h = harness(test_config());
        open_with_peer(&h);
        h.tx.push_outcomes(&[TxOutcome::Failed]);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(3)));
        assert_eq!(h.scheduler.drain_step(), DrainStatus::Dropped);
        assert_eq!(h.sink.permanent.lock().unwrap().len(), 1);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 0);
    }

    #[test]
    fn backpressure_fires_once_per_crossing() {
        let h = harness(test_config());
        open_with_peer(&h);
        // Cross the upper watermark (5) and go past it.
        for _ in 0..7 {
            assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        }
        assert_eq!(h.backpressure.events.lock().unwrap().clone(), vec![(0, true)]);
        // Drain down to the lower watermark (3).
        for _ in 0..4 {
            assert_eq!(h.scheduler.drain_step(), DrainStatus::Sent);
        }
        assert_eq!(
            h.backpressure.events.lock().unwrap().clone(),
            vec![(0, true), (0, false)]
        );
        // Draining further produces no more transitions.
        h.scheduler.drain();
        assert_eq!(h.backpressure.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn stream_setup_requested_after_threshold() {
        let h = harness(test_config());
        h.scheduler.set_port_open(0, true).unwrap();
        h.scheduler
            .register_peer(
                0,
                PEER_A,
                PeerCapabilities {
                    aggregation: true,
                    max_aggregate_size: 8192,
                    paused: false,
                },
            )
            .unwrap();
        h.admission.capacity.store(true, Ordering::Relaxed);
        // Threshold is deterministic (offset 2, window 1): the third
        // consecutive frame makes setup due.
        for _ in 0..3 {
            assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        }
        assert_eq!(h.scheduler.drain(), 3);
        assert_eq!(h.admission.setups.lock().unwrap().clone(), vec![(0, PEER_A)]);
        let snap = h.scheduler.snapshot(0).unwrap();
        let q = snap.queues.iter().find(|q| q.tid == 0).unwrap();
        assert_eq!(q.stream, "pending");
        // Peer answers: established, and no further setups are requested.
        assert!(h.scheduler.stream_established(0, 0, PEER_A).unwrap());
        for _ in 0..4 {
            assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        }
        h.scheduler.drain();
        assert_eq!(h.admission.setups.lock().unwrap().len(), 1);
    }

    #[test]
    fn stream_setup_retires_when_out_of_capacity() {
        let h = harness(test_config());
        h.scheduler.set_port_open(0, true).unwrap();
        h.scheduler
            .register_peer(
                0,
                PEER_A,
                PeerCapabilities {
                    aggregation: true,
                    max_aggregate_size: 8192,
                    paused: false,
                },
            )
            .unwrap();
        *h.admission.retire.lock().unwrap() = Some((5, PEER_B));
        for _ in 0..3 {
            assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        }
        h.scheduler.drain();
        assert_eq!(
            h.admission.teardowns.lock().unwrap().clone(),
            vec![(5, PEER_B)]
        );
        assert_eq!(h.admission.setups.lock().unwrap().clone(), vec![(0, PEER_A)]);
    }

    #[test]
    fn stream_setup_abandoned_without_capacity_or_victim() {
        let h = harness(test_config());
        h.scheduler.set_port_open(0, true).unwrap();
        h.scheduler
            .register_peer(
                0,
                PEER_A,
                PeerCapabilities {
                    aggregation: true,
                    max_aggregate_size: 8192,
                    paused: false,
                },
            )
            .unwrap();
        for _ in 0..3 {
            assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        }
        h.scheduler.drain();
        assert!(h.admission.setups.lock().unwrap().is_empty());
        let snap = h.scheduler.snapshot(0).unwrap();
        let q = snap.queues.iter().find(|q| q.tid == 0).unwrap();
        assert_eq!(q.stream, "none");
    }

    #[test]
    fn pause_and_resume_adjust_serviceability() {
        let h = harness(test_config());
        open_with_peer(&h);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert_eq!(h.scheduler.pause_peer(0, PEER_A, true).unwrap(), 2);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 0);
        assert!(!h.scheduler.has_pending());
        assert_eq!(h.scheduler.drain_step(), DrainStatus::Idle);
        // Pausing again is a no-op.
        assert_eq!(h.scheduler.pause_peer(0, PEER_A, true).unwrap(), 0);
        assert_eq!(h.scheduler.pause_peer(0, PEER_A, false).unwrap(), 2);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 2);
        assert_eq!(h.scheduler.drain(), 2);
    }

    #[test]
    fn remove_peer_drops_queued_frames() {
        let h = harness(test_config());
        open_with_peer(&h);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert!(h.scheduler.enqueue(0, PEER_A, frame(5)));
        assert_eq!(h.scheduler.remove_peer(0, PEER_A).unwrap(), 2);
        assert_eq!(h.sink.permanent.lock().unwrap().len(), 2);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 0);
        assert_eq!(h.scheduler.drain_step(), DrainStatus::Idle);
        // Removing the same peer again is a no-op.
        assert_eq!(h.scheduler.remove_peer(0, PEER_A).unwrap(), 0);
        assert_eq!(h.sink.permanent.lock().unwrap().len(), 2);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 0);
        // The peer is gone entirely: new traffic is rejected again.
        assert!(!h.scheduler.enqueue(0, PEER_A, frame(0)));
    }

    #[test]
    fn flush_interface_keeps_peers() {
        let h = harness(test_config());
        open_with_peer(&h);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert!(h.scheduler.enqueue(0, PEER_A, frame(6)));
        assert_eq!(h.scheduler.flush_interface(0).unwrap(), 2);
        assert_eq!(h.sink.permanent.lock().unwrap().len(), 2);
        assert_eq!(h.scheduler.queued_total(0).unwrap(), 0);
        // Peer registration survives the flush.
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert_eq!(h.scheduler.drain(), 1);
    }

    #[test]
    fn flush_restores_default_priority_order() {
        let h = harness(test_config());
        open_with_peer(&h);
        // Invert the ranking so background outranks voice, then flush.
        let mut params = [AcChannelParams::default(); 4];
        params[AccessCategory::Background.index()] = AcChannelParams { aifsn: 1, ecw_min: 1 };
        params[AccessCategory::BestEffort.index()] = AcChannelParams { aifsn: 3, ecw_min: 4 };
        params[AccessCategory::Video.index()] = AcChannelParams { aifsn: 5, ecw_min: 5 };
        params[AccessCategory::Voice.index()] = AcChannelParams { aifsn: 7, ecw_min: 6 };
        h.scheduler.reconfigure_priorities(0, &params).unwrap();
        assert_eq!(h.scheduler.flush_interface(0).unwrap(), 0);

        assert!(h.scheduler.enqueue(0, PEER_A, frame(1)));
        assert!(h.scheduler.enqueue(0, PEER_A, frame(6)));
        assert_eq!(h.scheduler.drain(), 2);
        // Default layout is back: voice drains before background.
        assert_eq!(h.tx.priorities(), vec![6, 1]);
    }

    #[test]
    fn snapshot_reports_head_of_queue_delay() {
        let h = harness(test_config());
        open_with_peer(&h);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        let snap = h.scheduler.snapshot(0).unwrap();
        for q in &snap.queues {
            if q.depth > 0 {
                assert!(q.head_delay_units.is_some());
            } else {
                assert_eq!(q.head_delay_units, None);
            }
        }
    }

    #[test]
    fn register_peer_is_idempotent() {
        let h = harness(test_config());
        assert!(h
            .scheduler
            .register_peer(0, PEER_A, PeerCapabilities::default())
            .unwrap());
        assert!(!h
            .scheduler
            .register_peer(0, PEER_A, PeerCapabilities::default())
            .unwrap());
        // One queue per TID, not two.
        let snap = h.scheduler.snapshot(0).unwrap();
        assert_eq!(snap.queues.len(), MAX_TIDS);
    }

    #[test]
    fn closed_port_queues_but_does_not_drain() {
        let h = harness(test_config());
        h.scheduler
            .register_peer(0, PEER_A, PeerCapabilities::default())
            .unwrap();
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert!(!h.scheduler.has_pending());
        assert_eq!(h.scheduler.drain_step(), DrainStatus::Idle);
        h.scheduler.set_port_open(0, true).unwrap();
        assert!(h.scheduler.has_pending());
        assert_eq!(h.scheduler.drain(), 1);
    }

    #[test]
    fn disabled_ac_downgrades_enqueued_tid() {
        let h = harness(test_config());
        open_with_peer(&h);
        h.scheduler
            .ac_status_update(
                0,
                AccessCategory::Voice,
                AcStatus {
                    enabled: false,
                    ..AcStatus::default()
                },
            )
            .unwrap();
        assert!(h.scheduler.enqueue(0, PEER_A, frame(6)));
        let pick = h.scheduler.pick_next(0).unwrap().unwrap();
        assert_eq!(pick.tid, 4); // voice sibling landed on the video pair
    }

    #[test]
    fn reconfigured_priorities_change_drain_order() {
        let h = harness(test_config());
        open_with_peer(&h);
        // Make background the lowest-backoff (highest priority) AC.
        let mut params = [AcChannelParams::default(); 4];
        params[AccessCategory::Background.index()] = AcChannelParams { aifsn: 1, ecw_min: 1 };
        params[AccessCategory::BestEffort.index()] = AcChannelParams { aifsn: 3, ecw_min: 4 };
        params[AccessCategory::Video.index()] = AcChannelParams { aifsn: 5, ecw_min: 5 };
        params[AccessCategory::Voice.index()] = AcChannelParams { aifsn: 7, ecw_min: 6 };
        h.scheduler.reconfigure_priorities(0, &params).unwrap();

        assert!(h.scheduler.enqueue(0, PEER_A, frame(7)));
        assert!(h.scheduler.enqueue(0, PEER_A, frame(2)));
        assert_eq!(h.scheduler.drain(), 2);
        assert_eq!(h.tx.priorities(), vec![2, 7]);
    }

    #[test]
    fn next_frame_len_hint_reports_following_frame() {
        let h = harness(test_config());
        open_with_peer(&h);
        assert!(h
            .scheduler
            .enqueue(0, PEER_A, Frame::new(Bytes::from_static(b"first"), 0)));
        assert!(h
            .scheduler
            .enqueue(0, PEER_A, Frame::new(Bytes::from_static(b"sec"), 0)));
        h.scheduler.drain();
        let sent = h.tx.sent.lock().unwrap().clone();
        assert_eq!(sent[0].1, Some(3)); // "sec" queued behind "first"
        assert_eq!(sent[1].1, None);
    }

    #[test]
    fn rekey_moves_queues_and_resets_streams() {
        let h = harness(test_config());
        open_with_peer(&h);
        assert!(h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert_eq!(h.scheduler.rekey_peer(0, PEER_A, PEER_B).unwrap(), MAX_TIDS);
        // Old address is unregistered, new one carries the frames.
        assert!(!h.scheduler.enqueue(0, PEER_A, frame(0)));
        assert!(h.scheduler.enqueue(0, PEER_B, frame(0)));
        assert_eq!(h.scheduler.drain(), 2);
    }

    #[test]
    fn interfaces_round_robin() {
        let mut config = test_config();
        config.interfaces = 2;
        let h = harness(config);
        for id in 0..2 {
            h.scheduler.set_port_open(id, true).unwrap();
            h.scheduler
                .register_peer(id, PEER_A, PeerCapabilities::default())
                .unwrap();
            h.scheduler.enqueue(id, PEER_A, frame(id as u8));
            h.scheduler.enqueue(id, PEER_A, frame(id as u8));
        }
        assert_eq!(h.scheduler.drain(), 4);
        // Frames alternate between the two interfaces.
        assert_eq!(h.tx.priorities(), vec![0, 1, 0, 1]);
    }
}
