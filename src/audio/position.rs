// PositionTracker - rational playback position and duration
//
// Frames are counted as integers and only turned into seconds at the UI
// boundary. The render callback is the only writer during playback; the seek
// controller resets the count while the callback is held off.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::audio::source::StreamDescriptor;
use crate::audio::time::MediaTime;

pub struct PositionTracker {
    sample_rate: u32,
    frames_buffered: AtomicU64,
    duration_frames: u64,
    /// Leading frames the source reports but playback skips
    correction: u64,
}

impl PositionTracker {
    /// Tracker for a stream of `reported_total` frames
    ///
    /// `correction` is subtracted from the reported duration and added to
    /// every source seek offset; pass 0 for sources without the frame-count quirk.
    pub fn new(sample_rate: u32, reported_total: u64, correction: u64) -> Self {
        Self {
            sample_rate,
            frames_buffered: AtomicU64::new(0),
            duration_frames: reported_total.saturating_sub(correction),
            correction,
        }
    }

    /// Tracker for `descriptor`, applying `correction` only if the source is flagged
    pub fn for_descriptor(descriptor: &StreamDescriptor, correction: u64) -> Self {
        let correction = if descriptor.frame_count_quirk {
            correction
        } else {
            0
        };
        Self::new(descriptor.sample_rate, descriptor.total_frames, correction)
    }

    /// Advance by `frames` real frames handed to the output
    ///
    /// Called from the render callback; a single relaxed add.
    #[inline]
    pub fn increment_frames_elapsed(&self, frames: usize) {
        self.frames_buffered
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn set_frames_buffered_at_sample_position(&self, sample_position: u64) {
        self.frames_buffered
            .store(sample_position, Ordering::Relaxed);
    }

    pub fn frames_buffered_samples(&self) -> u64 {
        self.frames_buffered.load(Ordering::Relaxed)
    }

    pub fn frames_buffered(&self) -> MediaTime {
        MediaTime::from_frames(self.frames_buffered_samples(), self.sample_rate)
    }

    pub fn duration_frames(&self) -> u64 {
        self.duration_frames
    }

    pub fn file_duration(&self) -> MediaTime {
        MediaTime::from_frames(self.duration_frames, self.sample_rate)
    }

    pub fn file_duration_in_seconds(&self) -> f64 {
        self.file_duration().seconds()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Sample position for `seconds`, floored and clamped to the playable range
    ///
    /// Negative and NaN inputs map to 0.
    pub fn convert_seconds_to_sample_position(&self, seconds: f64) -> u64 {
        if seconds.is_nan() || seconds <= 0.0 {
            return 0;
        }
        let position = (seconds * f64::from(self.sample_rate)).floor();
        if position >= self.duration_frames as f64 {
            self.duration_frames
        } else {
            position as u64
        }
    }

    /// Offset to hand the source so that playback starts at `sample_position`
    pub fn source_offset_for(&self, sample_position: u64) -> u64 {
        sample_position.saturating_add(self.correction)
    }
}
