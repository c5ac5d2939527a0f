use std::path::Path;

use rollcall_core::TrackerConfig;
use serde::Deserialize;

/// Daemon configuration: defaults, overlaid by an optional TOML file
/// (`ROLLCALL_CONFIG`), overlaid by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP address the ingest listener binds.
    pub listen_addr: String,
    /// Seconds of silence before a present identity is declared departed.
    pub absence_timeout_secs: u64,
    /// Minimum seconds between heartbeat events per identity.
    pub detection_log_interval_secs: u64,
    /// Seconds a completed session is retained before garbage collection.
    pub retention_horizon_secs: u64,
    /// Wall-clock sweep interval, in seconds.
    pub tick_interval_secs: u64,
    /// Capacity of the event ring and the broadcast channel.
    pub max_log_buffer: usize,
    /// Depth of the engine request queue; frames beyond it are dropped.
    pub frame_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        let tracker = TrackerConfig::default();
        Self {
            listen_addr: "127.0.0.1:7399".to_string(),
            absence_timeout_secs: tracker.absence_timeout_secs,
            detection_log_interval_secs: tracker.detection_log_interval_secs,
            retention_horizon_secs: tracker.retention_horizon_secs,
            tick_interval_secs: tracker.tick_interval_secs,
            max_log_buffer: tracker.max_log_buffer,
            frame_queue_depth: 64,
        }
    }
}

impl Config {
    /// Load configuration: file pointed to by `ROLLCALL_CONFIG` if set,
    /// then environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("ROLLCALL_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        self.absence_timeout_secs = env_u64("ROLLCALL_ABSENCE_TIMEOUT_SECS", self.absence_timeout_secs);
        self.detection_log_interval_secs = env_u64(
            "ROLLCALL_DETECTION_LOG_INTERVAL_SECS",
            self.detection_log_interval_secs,
        );
        self.retention_horizon_secs =
            env_u64("ROLLCALL_RETENTION_HORIZON_SECS", self.retention_horizon_secs);
        self.tick_interval_secs = env_u64("ROLLCALL_TICK_INTERVAL_SECS", self.tick_interval_secs);
        self.max_log_buffer = env_usize("ROLLCALL_MAX_LOG_BUFFER", self.max_log_buffer);
        self.frame_queue_depth = env_usize("ROLLCALL_FRAME_QUEUE_DEPTH", self.frame_queue_depth);
    }

    /// Timing knobs in the shape the core crate expects.
    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            absence_timeout_secs: self.absence_timeout_secs,
            detection_log_interval_secs: self.detection_log_interval_secs,
            retention_horizon_secs: self.retention_horizon_secs,
            tick_interval_secs: self.tick_interval_secs,
            max_log_buffer: self.max_log_buffer,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:7399");
        assert_eq!(config.absence_timeout_secs, 300);
        assert_eq!(config.frame_queue_depth, 64);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config: Config = toml::from_str(
            r#"
            listen_addr = "0.0.0.0:9000"
            absence_timeout_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.absence_timeout_secs, 120);
        assert_eq!(config.max_log_buffer, 500);
    }

    #[test]
    fn test_tracker_view() {
        let config = Config {
            absence_timeout_secs: 60,
            ..Config::default()
        };
        let tracker = config.tracker();
        assert_eq!(tracker.absence_timeout_secs, 60);
        assert_eq!(tracker.max_log_buffer, 500);
    }
}
