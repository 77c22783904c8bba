//! Per-(TID, destination) frame queue.
//!
//! Each destination a TID has traffic for gets its own FIFO. The queue
//! carries the peer's aggregation capability, a pause flag driven by peer
//! or power-save state, and the admission counters that decide when an
//! aggregation-stream setup should be attempted. The admission threshold
//! is randomized per queue inside a fixed window so that many destinations
//! coming up together do not fire their stream negotiations in lockstep.

use crate::frame::{Frame, MacAddr};
use rand::RngExt;
use std::collections::VecDeque;
use std::time::Duration;

/// Aggregation-stream negotiation state for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// No stream; setup may be attempted once the threshold is exceeded.
    #[default]
    None,
    /// Setup requested, waiting for the peer's answer.
    Pending,
    /// Stream up; frames on this queue are aggregation-eligible.
    Established,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::None => "none",
            StreamState::Pending => "pending",
            StreamState::Established => "established",
        }
    }
}

/// What a registered peer is capable of, captured at queue creation.
#[derive(Debug, Clone, Copy)]
pub struct PeerCapabilities {
    /// Whether aggregation streams may be negotiated with this peer.
    pub aggregation: bool,
    /// Largest aggregate the peer accepts, in bytes.
    pub max_aggregate_size: usize,
    /// Initial pause state (peer may already be in power save).
    pub paused: bool,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            aggregation: false,
            max_aggregate_size: 0,
            paused: false,
        }
    }
}

/// FIFO of pending frames for one (TID, destination) pair.
#[derive(Debug)]
pub struct DestinationQueue {
    dest: MacAddr,
    tid: usize,
    /// Monotonic creation stamp; an in-flight reference taken before the
    /// lock was dropped is only valid if the generation still matches.
    generation: u64,
    frames: VecDeque<Frame>,
    paused: bool,
    aggregation_enabled: bool,
    max_aggregate_size: usize,
    /// Frames enqueued since the last stream-setup attempt.
    consecutive_count: u32,
    /// Randomized per-queue trigger for stream setup.
    admission_threshold: u32,
    stream: StreamState,
    transmitted: u64,
    requeues: u64,
}

impl DestinationQueue {
    pub fn new(
        dest: MacAddr,
        tid: usize,
        generation: u64,
        caps: &PeerCapabilities,
        rng: &mut impl RngExt,
        threshold_offset: u32,
        threshold_window: u32,
    ) -> Self {
        Self {
            dest,
            tid,
            generation,
            frames: VecDeque::new(),
            paused: caps.paused,
            aggregation_enabled: caps.aggregation,
            max_aggregate_size: caps.max_aggregate_size,
            consecutive_count: 0,
            admission_threshold: random_threshold(rng, threshold_offset, threshold_window),
            stream: StreamState::None,
            transmitted: 0,
            requeues: 0,
        }
    }

    pub fn dest(&self) -> MacAddr {
        self.dest
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time the head frame has spent queued, in 2 ms units capped at `cap`.
    pub fn head_delay_units(&self, cap: Duration) -> Option<u8> {
        self.frames.front().map(|f| f.queue_delay_units(cap))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn aggregation_enabled(&self) -> bool {
        self.aggregation_enabled
    }

    pub fn max_aggregate_size(&self) -> usize {
        self.max_aggregate_size
    }

    pub fn stream(&self) -> StreamState {
        self.stream
    }

    pub fn set_stream(&mut self, state: StreamState) {
        self.stream = state;
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }

    pub fn admission_threshold(&self) -> u32 {
        self.admission_threshold
    }

    pub fn transmitted(&self) -> u64 {
        self.transmitted
    }

    pub fn requeues(&self) -> u64 {
        self.requeues
    }

    /// Append a frame. Returns true when the consecutive-frame count now
    /// exceeds the admission threshold, i.e. a stream-setup evaluation is
    /// due (the caller decides whether one is actually attempted).
    pub fn enqueue(&mut self, frame: Frame) -> bool {
        self.frames.push_back(frame);
        self.consecutive_count = self.consecutive_count.saturating_add(1);
        self.admission_due()
    }

    /// Whether the consecutive-frame count has exceeded the threshold.
    pub fn admission_due(&self) -> bool {
        self.consecutive_count > self.admission_threshold
    }

    /// Remove and return the head frame.
    pub fn dequeue_front(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Push a frame back onto the head after a transient transmit failure.
    /// Order is preserved and the admission counter is not re-triggered.
    pub fn requeue_front(&mut self, mut frame: Frame) {
        frame.mark_requeued();
        self.frames.push_front(frame);
        self.requeues += 1;
    }

    /// Byte length of the current head frame, as a do-ahead hint.
    pub fn next_frame_len(&self) -> Option<usize> {
        self.frames.front().map(Frame::len)
    }

    pub fn record_transmitted(&mut self) {
        self.transmitted += 1;
    }

    /// Mark a stream-setup attempt: moves to `Pending` and restarts the
    /// consecutive-frame count.
    pub fn begin_stream_setup(&mut self) {
        self.stream = StreamState::Pending;
        self.consecutive_count = 0;
    }

    /// Re-key the queue to a new destination (peer roamed): the admission
    /// threshold is re-randomized and the counters restart.
    pub fn rekey(&mut self, new_dest: MacAddr, rng: &mut impl RngExt, offset: u32, window: u32) {
        self.dest = new_dest;
        self.consecutive_count = 0;
        self.admission_threshold = random_threshold(rng, offset, window);
        self.stream = StreamState::None;
    }

    /// Take every queued frame out, leaving the queue empty.
    pub fn drain_all(&mut self) -> VecDeque<Frame> {
        self.consecutive_count = 0;
        std::mem::take(&mut self.frames)
    }
}

/// Random admission threshold in `[offset, offset + window)`.
fn random_threshold(rng: &mut impl RngExt, offset: u32, window: u32) -> u32 {
    if window <= 1 {
        offset
    } else {
        rng.random_range(offset..offset + window)
    }
}
