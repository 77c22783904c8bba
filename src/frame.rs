//! Outbound frame representation and queue-delay timestamping.
//!
//! A [`Frame`] is an opaque payload plus the traffic priority its producer
//! assigned to it. The scheduler stamps the frame on enqueue so that the
//! time it spent queued can be reported alongside the frame when it is
//! finally handed to the transmit path.

use bytes::Bytes;
use quanta::Instant;
use std::time::Duration;

/// 48-bit destination address.
pub type MacAddr = [u8; 6];

/// Broadcast/multicast destinations all collapse onto this address so that
/// group-addressed traffic shares one queue per TID.
pub const BROADCAST_ADDR: MacAddr = [0xff; 6];

/// Returns true if `addr` is a group (multicast/broadcast) address.
pub fn is_group_addr(addr: &MacAddr) -> bool {
    addr[0] & 0x01 != 0
}

/// Render a destination address as `aa:bb:cc:dd:ee:ff` for logs and stats.
pub fn fmt_mac(addr: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        addr[0], addr[1], addr[2], addr[3], addr[4], addr[5]
    )
}

/// A single outbound frame queued for transmission.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Opaque payload; the scheduler never inspects it.
    pub payload: Bytes,
    /// Traffic priority as submitted by the producer (0–7; out-of-range
    /// values classify to the best-effort TID).
    pub priority: u8,
    enqueued_at: Option<Instant>,
    requeued: bool,
}

impl Frame {
    pub fn new(payload: Bytes, priority: u8) -> Self {
        Self {
            payload,
            priority,
            enqueued_at: None,
            requeued: false,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Records the enqueue time. Called once when the frame enters a queue;
    /// a head-requeue after a transient transmit failure keeps the original
    /// stamp so the reported delay covers the full time in the driver.
    pub(crate) fn stamp_enqueued(&mut self) {
        if self.enqueued_at.is_none() {
            self.enqueued_at = Some(Instant::now());
        }
    }

    /// Marks the frame as having been requeued after a transient transmit
    /// failure. Requeued frames are not re-evaluated for stream admission.
    pub(crate) fn mark_requeued(&mut self) {
        self.requeued = true;
    }

    pub fn was_requeued(&self) -> bool {
        self.requeued
    }

    /// Time this frame has spent queued, or zero if it was never stamped.
    pub fn queue_delay(&self) -> Duration {
        self.enqueued_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Queue delay in 2 ms units, capped at `cap`, for delay accounting in
    /// the transmit path. With the default 510 ms cap the result fits the
    /// single byte the radio firmware historically expected.
    pub fn queue_delay_units(&self, cap: Duration) -> u8 {
        delay_units(self.queue_delay(), cap)
    }
}

/// Convert a queue delay to 2 ms units, saturating at `cap`.
pub fn delay_units(delay: Duration, cap: Duration) -> u8 {
    let ms = delay.min(cap).as_millis() as u64;
    (ms >> 1).min(u8::MAX as u64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_addr_detection() {
        assert!(is_group_addr(&BROADCAST_ADDR));
        assert!(is_group_addr(&[0x01, 0x00, 0x5e, 0, 0, 1]));
        assert!(!is_group_addr(&[0x02, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn delay_units_saturate_at_cap() {
        let cap = Duration::from_millis(510);
        assert_eq!(delay_units(Duration::ZERO, cap), 0);
        assert_eq!(delay_units(Duration::from_millis(2), cap), 1);
        assert_eq!(delay_units(Duration::from_millis(100), cap), 50);
        // Past the cap the value pins at cap/2.
        assert_eq!(delay_units(Duration::from_secs(10), cap), 255);
    }

    #[test]
    fn unstamped_frame_reports_zero_delay() {
        let f = Frame::new(Bytes::from_static(b"x"), 0);
        assert_eq!(f.queue_delay(), Duration::ZERO);
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            fmt_mac(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            "de:ad:be:ef:00:01"
        );
    }
}
