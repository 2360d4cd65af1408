use std::sync::{Mutex, MutexGuard};

use crate::audio::callback::{RenderCallback, RenderOutcome};
use crate::error::AudioError;

use super::{OutputBackend, OutputFormat};

/// Frames produced by one [`DesktopStubBackend::render`] call
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBlock {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub outcome: RenderOutcome,
}

/// Desktop stub backend used for deterministic testing and headless runs.
///
/// No device is opened. The caller plays the hardware's role by pumping
/// `render`, which runs the callback on the calling thread.
pub struct DesktopStubBackend {
    stream: Mutex<Option<(RenderCallback, OutputFormat)>>,
}

impl DesktopStubBackend {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<(RenderCallback, OutputFormat)>>, AudioError> {
        self.stream.lock().map_err(|_| AudioError::LockPoisoned {
            component: "desktop_stub".to_string(),
        })
    }

    /// Run one render call of `frames` frames
    pub fn render(&self, frames: usize) -> Result<RenderedBlock, AudioError> {
        let mut stream = self.lock()?;
        let (callback, _) = stream.as_mut().ok_or(AudioError::NotRunning)?;

        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        let outcome = callback.render_frames(frames, |frame, l, r| {
            left[frame] = l;
            right[frame] = r;
        });

        Ok(RenderedBlock {
            left,
            right,
            outcome,
        })
    }

    /// Format requested by the last `start`
    pub fn format(&self) -> Option<OutputFormat> {
        self.lock()
            .ok()
            .and_then(|stream| stream.as_ref().map(|(_, format)| *format))
    }
}

impl Default for DesktopStubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for DesktopStubBackend {
    fn start(&self, callback: RenderCallback, format: OutputFormat) -> Result<(), AudioError> {
        let mut stream = self.lock()?;
        if stream.is_some() {
            return Err(AudioError::AlreadyRunning);
        }
        *stream = Some((callback, format));
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        match self.lock()?.take() {
            Some(_) => Ok(()),
            None => Err(AudioError::NotRunning),
        }
    }

    fn is_running(&self) -> bool {
        self.lock().map(|stream| stream.is_some()).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "desktop_stub"
    }
}
