//! Playback event types fanned out to observers and broadcast subscribers.

use serde::{Deserialize, Serialize};

use crate::audio::source::TrackMetadata;
use crate::audio::time::MediaTime;

/// Externally visible engine state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PlaybackState {
    /// Nothing loaded
    Empty = 0,
    /// Loaded, stopped or finished
    Idle = 1,
    Playing = 2,
    Paused = 3,
    /// A fatal error ended playback; a new load is required
    Failed = 4,
}

impl PlaybackState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Idle,
            2 => PlaybackState::Playing,
            3 => PlaybackState::Paused,
            4 => PlaybackState::Failed,
            _ => PlaybackState::Empty,
        }
    }
}

/// Events published on the broadcast stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PlaybackEvent {
    StateChanged { state: PlaybackState },
    DurationKnown { duration: MediaTime },
    MetadataAvailable { metadata: TrackMetadata },
    PlaybackEnded,
    Underrun { frames: usize },
    Error { code: i32, message: String },
}
