//! Link-layer QoS transmit scheduler.
//!
//! `airsched` queues outbound frames per traffic identifier (TID) and per
//! destination, and drains them in WMM priority order: eight TIDs map
//! pairwise onto the four access categories (voice, video, best effort,
//! background), whose relative priority can be re-ranked at runtime from
//! advertised channel parameters. Within a TID, destinations are served
//! round-robin; across sibling TIDs of one access category, a fairness
//! rule alternates service; across interfaces, drain steps rotate.
//!
//! The scheduler is transport-agnostic. The physical transmit primitive,
//! the aggregation-stream admission exchange, producer backpressure and
//! frame-ownership callbacks all sit behind traits in [`interface`], so
//! the whole engine is exercisable in-process with mocks.
//!
//! ```no_run
//! use airsched::{Frame, PeerCapabilities, Scheduler, SchedulerConfig};
//! use bytes::Bytes;
//! # use std::sync::Arc;
//! # fn wire(tx: Arc<dyn airsched::TransmitPath>,
//! #         adm: Arc<dyn airsched::AdmissionControl>,
//! #         bp: Arc<dyn airsched::BackpressureSink>,
//! #         sink: Arc<dyn airsched::FrameSink>) -> anyhow::Result<()> {
//! let config = SchedulerConfig::default();
//! let scheduler = Scheduler::new(config, tx, adm, bp, sink);
//! let peer = [0x02, 0, 0, 0, 0, 0x01];
//! scheduler.register_peer(0, peer, PeerCapabilities::default())?;
//! scheduler.set_port_open(0, true)?;
//! scheduler.enqueue(0, peer, Frame::new(Bytes::from_static(b"hello"), 6));
//! scheduler.drain();
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod frame;
pub mod group;
pub mod interface;
pub mod priority;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod stats;

pub use admission::{AcStatus, AccessCategoryAdmission};
pub use config::{SchedulerConfig, SchedulerConfigInput};
pub use frame::{delay_units, fmt_mac, is_group_addr, Frame, MacAddr, BROADCAST_ADDR};
pub use interface::{AdmissionControl, BackpressureSink, FrameSink, TransmitPath, TxOutcome};
pub use priority::{
    ac_of_tid, rank_by_backoff, AcChannelParams, AccessCategory, PriorityMap, AC_TO_TID, MAX_TIDS,
};
pub use queue::{DestinationQueue, PeerCapabilities, StreamState};
pub use scheduler::{DrainStatus, Pick, Scheduler};
pub use stats::{CounterSnapshot, InterfaceCounters, InterfaceSnapshot, QueueSnapshot};
