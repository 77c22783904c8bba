//! Scheduler configuration.
//!
//! A raw [`SchedulerConfigInput`] deserializes from TOML with every field
//! optional; [`SchedulerConfigInput::resolve`] fills defaults, validates
//! cross-field constraints (the watermark pair in particular) and produces
//! the strongly-typed [`SchedulerConfig`] the scheduler is built from.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub interfaces: Option<usize>,
    pub upper_watermark: Option<u32>,
    pub lower_watermark: Option<u32>,
    pub admission_threshold_offset: Option<u32>,
    pub admission_threshold_window: Option<u32>,
    pub max_destinations_per_tid: Option<usize>,
    pub peer_gated: Option<bool>,
    pub queue_delay_cap_ms: Option<u64>,
}

/// Resolved scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of interfaces the scheduler serves.
    pub interfaces: usize,
    /// Unpaused-frame count at which producer backpressure is applied.
    pub upper_watermark: u32,
    /// Count at which backpressure is released again. Strictly below the
    /// upper watermark so the callbacks cannot chatter.
    pub lower_watermark: u32,
    /// Lower bound of the randomized stream-admission threshold.
    pub admission_threshold_offset: u32,
    /// Width of the randomization window (threshold in `[offset, offset+window)`).
    pub admission_threshold_window: u32,
    /// Destination-queue capacity per TID.
    pub max_destinations_per_tid: usize,
    /// When set, unicast frames to unregistered peers are rejected at
    /// enqueue instead of creating a queue on demand.
    pub peer_gated: bool,
    /// Saturation point for the head-of-queue delays reported in
    /// [`QueueSnapshot`](crate::stats::QueueSnapshot).
    pub queue_delay_cap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interfaces: 1,
            upper_watermark: 200,
            lower_watermark: 180,
            admission_threshold_offset: 16,
            admission_threshold_window: 16,
            max_destinations_per_tid: 32,
            peer_gated: true,
            queue_delay_cap: Duration::from_millis(510),
        }
    }
}

impl SchedulerConfigInput {
    pub fn resolve(self) -> Result<SchedulerConfig, String> {
        let defaults = SchedulerConfig::default();

        let interfaces = self.interfaces.unwrap_or(defaults.interfaces);
        if interfaces == 0 {
            return Err("interfaces must be at least 1".to_string());
        }

        let upper = self.upper_watermark.unwrap_or(defaults.upper_watermark);
        let lower = self.lower_watermark.unwrap_or(defaults.lower_watermark);
        if upper == 0 {
            return Err("upper_watermark must be positive".to_string());
        }
        if lower >= upper {
            return Err(format!(
                "lower_watermark ({}) must be below upper_watermark ({})",
                lower, upper
            ));
        }

        let window = self
            .admission_threshold_window
            .unwrap_or(defaults.admission_threshold_window)
            .max(1);

        let max_destinations = self
            .max_destinations_per_tid
            .unwrap_or(defaults.max_destinations_per_tid);
        if max_destinations == 0 {
            return Err("max_destinations_per_tid must be at least 1".to_string());
        }

        Ok(SchedulerConfig {
            interfaces,
            upper_watermark: upper,
            lower_watermark: lower,
            admission_threshold_offset: self
                .admission_threshold_offset
                .unwrap_or(defaults.admission_threshold_offset),
            admission_threshold_window: window,
            max_destinations_per_tid: max_destinations,
            peer_gated: self.peer_gated.unwrap_or(defaults.peer_gated),
            queue_delay_cap: self
                .queue_delay_cap_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_delay_cap),
        })
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(SchedulerConfig::default());
        }
        let parsed: SchedulerConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}
