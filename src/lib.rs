// PCM Streamer - real-time streaming playback engine
// Ring-buffered PCM playback with a lock-free render path

// Module declarations
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;
pub mod testing;

// Re-exports for convenience
pub use audio::{FrameSource, MediaTime, SeekOutcome, StreamDescriptor, TrackMetadata};
pub use config::PlayerConfig;
pub use engine::PlaybackEngine;
pub use error::{AudioError, ErrorCode};
pub use telemetry::{PlaybackEvent, PlaybackObserver, PlaybackState};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global tracing subscriber, bridging `log` records
///
/// Output goes to stderr. `RUST_LOG` overrides the default
/// `pcm_streamer=info` filter. Calling this more than once is harmless.
#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pcm_streamer=info,pcm_player=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Install the global tracing subscriber, writing to logcat
#[cfg(target_os = "android")]
pub fn init_logging() {
    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("pcm_streamer=debug"));
    let _ = match tracing_android::layer("PcmStreamer") {
        Ok(layer) => registry.with(layer).try_init(),
        Err(_) => registry.try_init(),
    };
}

/// JNI_OnLoad is called when the native library is loaded by Android
/// This function initializes the Android context required by oboe-rs
#[cfg(target_os = "android")]
#[no_mangle]
pub extern "system" fn JNI_OnLoad(
    vm: jni::JavaVM,
    _reserved: *mut std::ffi::c_void,
) -> jni::sys::jint {
    init_logging();

    log::info!("JNI_OnLoad called - initializing Android context");

    // SAFETY: must run before any Oboe call. The VM pointer comes from the
    // Android runtime and stays valid for the life of the process.
    unsafe {
        ndk_context::initialize_android_context(
            vm.get_java_vm_pointer().cast(),
            std::ptr::null_mut(),
        );
    }

    log::info!("Android context initialized successfully");

    jni::sys::JNI_VERSION_1_6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }

    #[test]
    fn test_reexports_resolve() {
        let config = PlayerConfig::default();
        assert!(config.validate().is_ok());
        let err: AudioError = AudioError::NoFileLoaded;
        assert_eq!(err.code(), error::AudioErrorCodes::NO_FILE_LOADED);
    }
}
