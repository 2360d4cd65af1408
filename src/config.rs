//! Configuration management for the streaming engine
//!
//! This module provides runtime configuration loading from JSON files,
//! so buffer geometry and cycler timing can be tuned per device without
//! recompilation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::audio::buffer_pool::{DEFAULT_BUFFER_COUNT, MIN_BUFFER_COUNT};
use crate::error::AudioError;

/// Complete player configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub playback: PlaybackConfig,
    pub output: OutputConfig,
}

/// Ring buffer and cycler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Number of buffers in the ring (minimum 2)
    pub buffer_count: usize,
    /// Frames held by each buffer
    pub frames_per_buffer: usize,
    /// Native render slice of the output hardware; buffers are sized in multiples of it
    pub render_slice_frames: usize,
    /// Frames decoded per sub-read while filling; bounds cancellation latency
    pub fill_chunk_frames: usize,
    /// Periodic wake interval of the cycler when no refill was signalled
    pub cycle_interval_ms: u64,
    /// Upper bound on the seek controller's wait for cancellation acknowledgement
    pub seek_cancel_timeout_ms: u64,
    /// Frames subtracted from the reported duration of sources flagged with the
    /// frame-count quirk
    pub frame_count_correction: u64,
    /// Capacity of the render-thread event queue
    pub event_queue_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            frames_per_buffer: 8192,
            render_slice_frames: 1024,
            fill_chunk_frames: 1024,
            cycle_interval_ms: 10,
            seek_cancel_timeout_ms: 500,
            frame_count_correction: 0,
            event_queue_capacity: 64,
        }
    }
}

impl PlaybackConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn seek_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_cancel_timeout_ms)
    }
}

/// Output device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Ask the device for the file's sample rate instead of its default
    pub match_file_sample_rate: bool,
    /// Capacity of the playback event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            match_file_sample_rate: true,
            event_channel_capacity: 128,
        }
    }
}

impl PlayerConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// Loaded configuration, or the defaults if the file is missing or invalid
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from the default asset location
    pub fn load() -> Self {
        Self::load_from_file("assets/player_config.json")
    }

    /// Check buffer geometry and timing values
    pub fn validate(&self) -> Result<(), AudioError> {
        let playback = &self.playback;

        if playback.buffer_count < MIN_BUFFER_COUNT {
            return Err(AudioError::InvalidBufferCount {
                count: playback.buffer_count,
            });
        }
        if playback.render_slice_frames == 0 {
            return Err(AudioError::InvalidConfig {
                reason: "render_slice_frames must be greater than 0".to_string(),
            });
        }
        if playback.frames_per_buffer == 0
            || playback.frames_per_buffer % playback.render_slice_frames != 0
        {
            return Err(AudioError::InvalidConfig {
                reason: format!(
                    "frames_per_buffer ({}) must be a non-zero multiple of render_slice_frames ({})",
                    playback.frames_per_buffer, playback.render_slice_frames
                ),
            });
        }
        if playback.fill_chunk_frames == 0 {
            return Err(AudioError::InvalidConfig {
                reason: "fill_chunk_frames must be greater than 0".to_string(),
            });
        }
        if playback.event_queue_capacity == 0 || self.output.event_channel_capacity == 0 {
            return Err(AudioError::InvalidConfig {
                reason: "event queue capacities must be greater than 0".to_string(),
            });
        }
        if playback.seek_cancel_timeout_ms == 0 {
            return Err(AudioError::InvalidConfig {
                reason: "seek_cancel_timeout_ms must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.playback.buffer_count, 3);
        assert_eq!(config.playback.frames_per_buffer, 8192);
        assert_eq!(config.playback.render_slice_frames, 1024);
        assert_eq!(config.playback.frame_count_correction, 0);
        assert!(config.output.match_file_sample_rate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = PlayerConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: PlayerConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.playback.buffer_count, config.playback.buffer_count);
        assert_eq!(
            parsed.playback.seek_cancel_timeout_ms,
            config.playback.seek_cancel_timeout_ms
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: PlayerConfig =
            serde_json::from_str(r#"{ "playback": { "buffer_count": 4 } }"#).unwrap();
        assert_eq!(parsed.playback.buffer_count, 4);
        assert_eq!(parsed.playback.frames_per_buffer, 8192);
        assert_eq!(parsed.output.event_channel_capacity, 128);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = PlayerConfig::load_from_file("/nonexistent/player_config.json");
        assert_eq!(config.playback.buffer_count, DEFAULT_BUFFER_COUNT);
    }

    #[test]
    fn test_validate_rejects_single_buffer() {
        let mut config = PlayerConfig::default();
        config.playback.buffer_count = 1;
        assert_eq!(
            config.validate(),
            Err(AudioError::InvalidBufferCount { count: 1 })
        );
    }

    #[test]
    fn test_validate_rejects_unaligned_buffer_size() {
        let mut config = PlayerConfig::default();
        config.playback.frames_per_buffer = 1000;
        assert!(matches!(
            config.validate(),
            Err(AudioError::InvalidConfig { .. })
        ));
    }
}
