//! Playback configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlaybackError, Result};
use crate::sampling::SamplePolicy;

/// Options recognized by the loader and the live query layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Load every Nth frame (1 = all frames).
    /// Default: 1
    pub frame_step: u32,

    /// Precompute every sampled frame into a dense buffer (high RAM usage)
    /// instead of querying the store on every frame change.
    /// Default: false
    pub big_data_mode: bool,

    /// Materialize full per-agent paths as curves. Slow on large files.
    /// Default: false
    pub load_full_paths: bool,

    /// Initial visibility of path curves once they are created.
    /// Default: false
    pub show_paths: bool,

    /// Display scale for agents in meters. Passed through to the scene.
    /// Default: 1.0
    pub agent_scale: f64,

    /// Bevel depth of walkable-area boundary curves.
    /// Default: 0.05
    pub geometry_thickness: f64,

    /// Bevel depth of agent path curves.
    /// Default: 0.02
    pub path_thickness: f64,

    /// Entities handled per tick by the chunked stages.
    /// Default: 10
    pub chunk_size: usize,

    /// Streamed frames kept in the live query cache (0 disables it).
    /// Default: 64
    pub stream_cache_frames: usize,

    /// Rows scanned between cancellation checks in the background worker.
    /// Default: 10000
    pub cancel_check_rows: usize,

    /// Interval at which the host is expected to tick the session.
    /// Default: 50 ms
    pub tick_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_step: 1,
            big_data_mode: false,
            load_full_paths: false,
            show_paths: false,
            agent_scale: 1.0,
            geometry_thickness: 0.05,
            path_thickness: 0.02,
            chunk_size: 10,
            stream_cache_frames: 64,
            cancel_check_rows: 10_000,
            tick_interval_ms: 50,
        }
    }
}

impl PlaybackConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| PlaybackError::ConfigError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.frame_step == 0 {
            return Err(config_error("frame_step must be at least 1"));
        }
        if !(0.01..=10.0).contains(&self.agent_scale) {
            return Err(config_error(format!(
                "agent_scale must be within 0.01..=10.0, got {}",
                self.agent_scale
            )));
        }
        for (name, value) in [
            ("geometry_thickness", self.geometry_thickness),
            ("path_thickness", self.path_thickness),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(config_error(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.chunk_size == 0 {
            return Err(config_error("chunk_size must be at least 1"));
        }
        if self.cancel_check_rows == 0 {
            return Err(config_error("cancel_check_rows must be at least 1"));
        }
        if self.tick_interval_ms == 0 {
            return Err(config_error("tick_interval_ms must be at least 1"));
        }
        Ok(())
    }

    pub fn sample_policy(&self) -> SamplePolicy {
        SamplePolicy::new(self.frame_step)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn config_error(message: impl Into<String>) -> PlaybackError {
    PlaybackError::ConfigError {
        message: message.into(),
    }
}
