use std::sync::{Mutex, MutexGuard};

use oboe::{
    AudioOutputCallback, AudioOutputStreamSafe, AudioStream, AudioStreamAsync,
    AudioStreamBuilder, DataCallbackResult, Output, PerformanceMode, SharingMode,
};

use crate::audio::callback::RenderCallback;
use crate::error::AudioError;

use super::{OutputBackend, OutputFormat};

/// Adapts the render callback to Oboe's stereo f32 frame layout
pub struct OboeRenderCallback {
    callback: RenderCallback,
}

impl AudioOutputCallback for OboeRenderCallback {
    type FrameType = (f32, oboe::Stereo);

    fn on_audio_ready(
        &mut self,
        _stream: &mut dyn AudioOutputStreamSafe,
        frames: &mut [(f32, f32)],
    ) -> DataCallbackResult {
        self.callback
            .render_frames(frames.len(), |frame, left, right| frames[frame] = (left, right));
        DataCallbackResult::Continue
    }
}

type OboeStream = AudioStreamAsync<Output, OboeRenderCallback>;

/// Android backend driving a low-latency Oboe output stream.
///
/// Output is always stereo; mono sources arrive with both channels equal.
pub struct OboeBackend {
    stream: Mutex<Option<OboeStream>>,
}

impl OboeBackend {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<OboeStream>>, AudioError> {
        self.stream.lock().map_err(|_| AudioError::LockPoisoned {
            component: "oboe_backend".to_string(),
        })
    }
}

impl Default for OboeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for OboeBackend {
    fn start(&self, callback: RenderCallback, format: OutputFormat) -> Result<(), AudioError> {
        let mut slot = self.lock()?;
        if slot.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        let sample_rate = i32::try_from(format.sample_rate).map_err(|_| {
            AudioError::StreamOpenFailed {
                reason: format!("sample rate {} out of range", format.sample_rate),
            }
        })?;

        let mut stream = AudioStreamBuilder::default()
            .set_performance_mode(PerformanceMode::LowLatency)
            .set_sharing_mode(SharingMode::Exclusive)
            .set_direction::<Output>()
            .set_sample_rate(sample_rate)
            .set_channel_count::<oboe::Stereo>()
            .set_format::<f32>()
            .set_callback(OboeRenderCallback { callback })
            .open_stream()
            .map_err(|err| AudioError::StreamOpenFailed {
                reason: format!("Failed to open output stream: {:?}", err),
            })?;

        stream.start().map_err(|err| AudioError::HardwareError {
            details: format!("Failed to start output stream: {:?}", err),
        })?;

        log::info!("[OboeBackend] Output stream started at {} Hz", format.sample_rate);
        *slot = Some(stream);
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        let mut stream = self.lock()?.take().ok_or(AudioError::NotRunning)?;
        stream.stop().map_err(|err| AudioError::HardwareError {
            details: format!("Failed to stop output stream: {:?}", err),
        })?;
        log::info!("[OboeBackend] Output stream stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lock().map(|stream| stream.is_some()).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "oboe"
    }
}
