//! Frame sources: the decoder seam between container formats and the ring.
//!
//! A [`FrameSource`] hands out planar `f32` frames on demand. The cycler and
//! the seek controller are its only callers; the render callback never sees it.

use serde::{Deserialize, Serialize};

use crate::audio::time::MediaTime;
use crate::error::AudioError;

/// Sample encoding of the underlying stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Int8,
    Int16,
    Int24,
    Int32,
    Float32,
}

impl SampleFormat {
    pub fn bits_per_sample(&self) -> u16 {
        match self {
            SampleFormat::Int8 => 8,
            SampleFormat::Int16 => 16,
            SampleFormat::Int24 => 24,
            SampleFormat::Int32 | SampleFormat::Float32 => 32,
        }
    }
}

/// Format of a loaded stream, fixed for the lifetime of the load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub sample_format: SampleFormat,
    pub bits_per_sample: u16,
    /// Frame count as reported by the container
    pub total_frames: u64,
    /// The reported frame count includes encoder priming frames at the start
    pub frame_count_quirk: bool,
}

impl StreamDescriptor {
    /// Reported duration, before any quirk correction
    pub fn reported_duration(&self) -> MediaTime {
        MediaTime::from_frames(self.total_frames, self.sample_rate)
    }
}

/// Result of one `read_frames` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRead {
    pub frames: usize,
    /// No frames remain after this read
    pub at_end: bool,
}

/// Descriptive data delivered with the metadata-available notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub descriptor: StreamDescriptor,
}

/// Decoder interface used by the cycler and seek controller
///
/// Calls may block on I/O, so implementations are only ever driven from the
/// cycler thread or the control thread.
pub trait FrameSource: Send {
    fn descriptor(&self) -> &StreamDescriptor;

    /// Read up to `max_frames` frames into the channel slices
    ///
    /// `right` is only consulted for stereo streams. Short reads are allowed;
    /// callers keep reading until `at_end` is reported.
    fn read_frames(
        &mut self,
        left: &mut [f32],
        right: Option<&mut [f32]>,
        max_frames: usize,
    ) -> Result<FrameRead, AudioError>;

    /// Position the next read at `sample_offset` frames from the start
    fn seek(&mut self, sample_offset: u64) -> Result<(), AudioError>;

    fn close(&mut self) {}

    fn metadata(&self) -> TrackMetadata {
        TrackMetadata {
            title: None,
            descriptor: self.descriptor().clone(),
        }
    }
}

/// Source over pre-decoded planar samples
pub struct MemoryFrameSource {
    descriptor: StreamDescriptor,
    channels: Vec<Vec<f32>>,
    position: usize,
    title: Option<String>,
}

impl MemoryFrameSource {
    /// Build from one sample vector per channel
    ///
    /// # Errors
    /// `UnsupportedFormat` for a zero sample rate, a channel count other than
    /// 1 or 2, or channels of unequal length.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat {
                reason: "sample rate must be greater than 0".to_string(),
            });
        }
        if !(1..=2).contains(&channels.len()) {
            return Err(AudioError::UnsupportedFormat {
                reason: format!("{} channels (expected 1 or 2)", channels.len()),
            });
        }
        let frames = channels[0].len();
        if channels.iter().any(|channel| channel.len() != frames) {
            return Err(AudioError::UnsupportedFormat {
                reason: "channels have different lengths".to_string(),
            });
        }

        Ok(Self {
            descriptor: StreamDescriptor {
                sample_rate,
                channel_count: channels.len() as u16,
                sample_format: SampleFormat::Float32,
                bits_per_sample: 32,
                total_frames: frames as u64,
                frame_count_quirk: false,
            },
            channels,
            position: 0,
            title: None,
        })
    }

    /// Prepend `priming_frames` of encoder priming silence and flag the quirk
    ///
    /// The reported frame count then includes the priming frames, as it does
    /// for compressed sources decoded with an encoder delay.
    pub fn with_frame_count_quirk(mut self, priming_frames: usize) -> Self {
        for channel in self.channels.iter_mut() {
            channel.splice(0..0, std::iter::repeat(0.0).take(priming_frames));
        }
        self.descriptor.total_frames = self.len() as u64;
        self.descriptor.frame_count_quirk = true;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn len(&self) -> usize {
        self.channels[0].len()
    }
}

impl FrameSource for MemoryFrameSource {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn read_frames(
        &mut self,
        left: &mut [f32],
        right: Option<&mut [f32]>,
        max_frames: usize,
    ) -> Result<FrameRead, AudioError> {
        let start = self.position;
        let frames = max_frames
            .min(left.len())
            .min(self.len().saturating_sub(start));

        left[..frames].copy_from_slice(&self.channels[0][start..start + frames]);
        if let (Some(right), Some(source)) = (right, self.channels.get(1)) {
            let frames = frames.min(right.len());
            right[..frames].copy_from_slice(&source[start..start + frames]);
        }

        self.position += frames;
        Ok(FrameRead {
            frames,
            at_end: self.position >= self.len(),
        })
    }

    fn seek(&mut self, sample_offset: u64) -> Result<(), AudioError> {
        let offset = usize::try_from(sample_offset)
            .ok()
            .filter(|offset| *offset <= self.len())
            .ok_or_else(|| AudioError::SeekFailed {
                sample_offset,
                reason: format!("beyond end of stream ({} frames)", self.len()),
            })?;
        self.position = offset;
        Ok(())
    }

    fn metadata(&self) -> TrackMetadata {
        TrackMetadata {
            title: self.title.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}
