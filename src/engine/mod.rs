//! Engine module: output backends and the `PlaybackEngine` facade.
//!
//! `backend` is the trait seam to audio hardware; `core` wires a loaded
//! source, the buffer ring, the cycler and a backend into one playback
//! session.

pub mod backend;
pub mod core;

#[cfg(not(target_os = "android"))]
pub use backend::CpalBackend;
#[cfg(target_os = "android")]
pub use backend::OboeBackend;
pub use backend::{DesktopStubBackend, OutputBackend, OutputFormat, RenderedBlock};
pub use core::PlaybackEngine;
