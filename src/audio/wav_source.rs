// WAV file frame source backed by hound
//
// Integer samples are normalised by 2^(bits-1)-1, so full-scale positive maps to 1.0.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::audio::source::{
    FrameRead, FrameSource, SampleFormat, StreamDescriptor, TrackMetadata,
};
use crate::error::AudioError;

pub struct WavFrameSource {
    reader: hound::WavReader<BufReader<File>>,
    descriptor: StreamDescriptor,
    position: u64,
    title: Option<String>,
}

impl WavFrameSource {
    /// Open a WAV file and read its format
    ///
    /// # Errors
    /// - `FileOpenFailed` if the file cannot be opened
    /// - `UnsupportedFormat` for a malformed header, more than two channels,
    ///   or a sample layout other than 8/16/24/32-bit int or 32-bit float
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|err| match err {
            hound::Error::IoError(io) => AudioError::FileOpenFailed {
                path: path.display().to_string(),
                reason: io.to_string(),
            },
            other => AudioError::from(other),
        })?;

        let spec = reader.spec();
        if !(1..=2).contains(&spec.channels) {
            return Err(AudioError::UnsupportedFormat {
                reason: format!("{} channels (expected 1 or 2)", spec.channels),
            });
        }
        let sample_format = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Float, 32) => SampleFormat::Float32,
            (hound::SampleFormat::Int, 8) => SampleFormat::Int8,
            (hound::SampleFormat::Int, 16) => SampleFormat::Int16,
            (hound::SampleFormat::Int, 24) => SampleFormat::Int24,
            (hound::SampleFormat::Int, 32) => SampleFormat::Int32,
            (format, bits) => {
                return Err(AudioError::UnsupportedFormat {
                    reason: format!("{:?} samples with {} bits", format, bits),
                })
            }
        };

        let descriptor = StreamDescriptor {
            sample_rate: spec.sample_rate,
            channel_count: spec.channels,
            sample_format,
            bits_per_sample: spec.bits_per_sample,
            total_frames: u64::from(reader.duration()),
            frame_count_quirk: false,
        };

        log::info!(
            "[WavFrameSource] Opened {}: {} Hz, {} ch, {:?}, {} frames",
            path.display(),
            descriptor.sample_rate,
            descriptor.channel_count,
            descriptor.sample_format,
            descriptor.total_frames
        );

        Ok(Self {
            reader,
            descriptor,
            position: 0,
            title: path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
        })
    }

    fn read_interleaved<S, F>(
        &mut self,
        frames: usize,
        left: &mut [f32],
        mut right: Option<&mut [f32]>,
        convert: F,
    ) -> Result<usize, AudioError>
    where
        S: hound::Sample,
        F: Fn(S) -> f32,
    {
        let channels = usize::from(self.descriptor.channel_count);
        let mut samples = self.reader.samples::<S>();
        let mut produced = 0;

        while produced < frames {
            for channel in 0..channels {
                let sample = match samples.next() {
                    Some(sample) => sample.map_err(|err| AudioError::DecodeFailed {
                        reason: err.to_string(),
                    })?,
                    // Data chunk shorter than the header claims
                    None => return Ok(produced),
                };
                let value = convert(sample);
                match channel {
                    0 => left[produced] = value,
                    _ => {
                        if let Some(right) = right.as_deref_mut() {
                            right[produced] = value;
                        }
                    }
                }
            }
            produced += 1;
        }
        Ok(produced)
    }
}

impl FrameSource for WavFrameSource {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn read_frames(
        &mut self,
        left: &mut [f32],
        right: Option<&mut [f32]>,
        max_frames: usize,
    ) -> Result<FrameRead, AudioError> {
        let remaining = self.descriptor.total_frames.saturating_sub(self.position);
        let mut frames = max_frames
            .min(left.len())
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if let Some(right) = right.as_deref() {
            frames = frames.min(right.len());
        }

        let produced = match self.descriptor.sample_format {
            SampleFormat::Float32 => self.read_interleaved::<f32, _>(frames, left, right, |s| s)?,
            _ => {
                let max = ((1i64 << (self.descriptor.bits_per_sample - 1)) - 1) as f32;
                self.read_interleaved::<i32, _>(frames, left, right, |s| s as f32 / max)?
            }
        };

        self.position += produced as u64;
        let truncated = produced < frames;
        if truncated {
            log::warn!(
                "[WavFrameSource] Data ended at frame {} of {}",
                self.position,
                self.descriptor.total_frames
            );
            self.position = self.descriptor.total_frames;
        }

        Ok(FrameRead {
            frames: produced,
            at_end: truncated || self.position >= self.descriptor.total_frames,
        })
    }

    fn seek(&mut self, sample_offset: u64) -> Result<(), AudioError> {
        if sample_offset > self.descriptor.total_frames {
            return Err(AudioError::SeekFailed {
                sample_offset,
                reason: format!(
                    "beyond end of stream ({} frames)",
                    self.descriptor.total_frames
                ),
            });
        }
        let offset = u32::try_from(sample_offset).map_err(|_| AudioError::SeekFailed {
            sample_offset,
            reason: "offset exceeds WAV addressable range".to_string(),
        })?;
        self.reader
            .seek(offset)
            .map_err(|err| AudioError::SeekFailed {
                sample_offset,
                reason: err.to_string(),
            })?;
        self.position = sample_offset;
        Ok(())
    }

    fn metadata(&self) -> TrackMetadata {
        TrackMetadata {
            title: self.title.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}
