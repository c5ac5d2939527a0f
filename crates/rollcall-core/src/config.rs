use serde::{Deserialize, Serialize};

/// Timing and capacity knobs for the tracker and emitter.
///
/// Defaults mirror the deployed camera pipeline: a five-minute absence
/// timeout, two-minute heartbeat throttle, one-hour session retention,
/// one-second sweep, 500-event ring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Seconds without any observation before a present identity is
    /// declared departed.
    pub absence_timeout_secs: u64,
    /// Minimum seconds between `detection` heartbeat events for the
    /// same identity.
    pub detection_log_interval_secs: u64,
    /// Seconds a completed (logged-out) session is retained before
    /// garbage collection.
    pub retention_horizon_secs: u64,
    /// Interval of the wall-clock sweep, in seconds.
    pub tick_interval_secs: u64,
    /// Capacity of the emitted-event ring; oldest entries are evicted.
    pub max_log_buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            absence_timeout_secs: 300,
            detection_log_interval_secs: 120,
            retention_horizon_secs: 3600,
            tick_interval_secs: 1,
            max_log_buffer: 500,
        }
    }
}

impl TrackerConfig {
    pub fn absence_timeout(&self) -> f64 {
        self.absence_timeout_secs as f64
    }

    pub fn detection_log_interval(&self) -> f64 {
        self.detection_log_interval_secs as f64
    }

    pub fn retention_horizon(&self) -> f64 {
        self.retention_horizon_secs as f64
    }
}
