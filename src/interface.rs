//! Collaborator interfaces the scheduler is wired to.
//!
//! The scheduler is a pure in-memory engine: everything that touches
//! hardware, firmware, or the producing stack sits behind one of these
//! traits. None of them is ever invoked while the queue-state lock is
//! held — the transmit path may block, and the admission-control exchange
//! is a round trip to the peer.

use crate::frame::{Frame, MacAddr};
use anyhow::Result;

/// Result of handing one frame to the physical transmit primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Frame accepted by the transmit path.
    Sent,
    /// Transient resource exhaustion; the frame will be requeued at the
    /// head of its queue and retried on the next drain step.
    Busy,
    /// Permanent failure; the frame is dropped and its owner notified once.
    Failed,
}

/// The physical transmit primitive (radio/bus binding).
pub trait TransmitPath: Send + Sync {
    /// Transmit one frame. `next_frame_len` is the byte length of the frame
    /// queued directly behind this one, when known — a do-ahead hint some
    /// transports use to size their next buffer.
    fn transmit(&self, frame: &Frame, next_frame_len: Option<usize>) -> TxOutcome;
}

/// The admission-control / aggregation-stream collaborator.
///
/// Stream setup and teardown are asynchronous negotiations with the peer;
/// the scheduler only ever *requests* them and is told the result later via
/// [`Scheduler::stream_established`](crate::scheduler::Scheduler::stream_established)
/// or [`Scheduler::stream_rejected`](crate::scheduler::Scheduler::stream_rejected).
pub trait AdmissionControl: Send + Sync {
    /// Whether a new aggregation stream can currently be created.
    fn stream_capacity_available(&self) -> bool;

    /// Ask the peer to set up an aggregation stream for (tid, dest).
    fn request_stream_setup(&self, tid: usize, dest: MacAddr) -> Result<()>;

    /// Ask the peer to tear down the stream for (tid, dest).
    fn request_stream_teardown(&self, tid: usize, dest: MacAddr) -> Result<()>;

    /// When no stream capacity remains, pick the least useful existing
    /// stream to retire in favour of (tid, dest). `None` means nothing is
    /// worth retiring and the setup attempt is abandoned.
    fn find_stream_to_retire(&self, tid: usize, dest: MacAddr) -> Option<(usize, MacAddr)>;
}

/// Producer-side flow control sink.
///
/// `apply = true` is fired once when an interface's queued total crosses
/// its upper watermark; `apply = false` once it falls back to the lower
/// watermark. The hysteresis guarantees the callback never chatters, and
/// delivery is serialized per interface: an `apply` is always observed
/// before the `release` that follows it, even across racing producer and
/// drain threads. Implementations must not call back into the scheduler
/// from inside `on_backpressure`; the delivery lock is still held.
pub trait BackpressureSink: Send + Sync {
    fn on_backpressure(&self, interface: usize, apply: bool);
}

/// Frame-ownership callbacks.
///
/// Exactly one of these is invoked for every frame the scheduler cannot
/// ultimately deliver; frames handed successfully to the transmit path get
/// neither.
pub trait FrameSink: Send + Sync {
    /// The frame could not be queued at all (unknown peer, queue table full).
    fn on_queue_failure(&self, frame: Frame);

    /// The frame was queued but is now permanently undeliverable (transmit
    /// failure, peer removed, interface flushed).
    fn on_permanent_failure(&self, frame: Frame);
}
