//! Output backends: the seam between the render callback and audio hardware.

use serde::{Deserialize, Serialize};

use crate::audio::callback::RenderCallback;
use crate::error::AudioError;

/// Stream format requested from the output device.
///
/// The engine performs no sample-rate conversion, so the device is asked for
/// the file's own rate and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Trait implemented by platform-specific output backends.
///
/// A backend owns the [`RenderCallback`] for as long as its stream runs and
/// invokes it from the device's real-time thread.
pub trait OutputBackend: Send + Sync {
    fn start(&self, callback: RenderCallback, format: OutputFormat) -> Result<(), AudioError>;
    fn stop(&self) -> Result<(), AudioError>;
    fn is_running(&self) -> bool;
    fn name(&self) -> &'static str;
}

#[cfg(target_os = "android")]
mod oboe;
#[cfg(target_os = "android")]
pub use oboe::OboeBackend;

#[cfg(not(target_os = "android"))]
mod cpal;
#[cfg(not(target_os = "android"))]
pub use cpal::CpalBackend;

mod desktop_stub;
pub use desktop_stub::{DesktopStubBackend, RenderedBlock};
