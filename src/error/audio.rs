// Audio error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Audio error code constants
///
/// Single source of truth for the numeric codes surfaced to observers,
/// the broadcast event stream and the CLI exit path.
///
/// Error code range: 2001-2015
pub struct AudioErrorCodes {}

impl AudioErrorCodes {
    /// Buffer pool memory could not be reserved
    pub const ALLOCATION_FAILED: i32 = 2001;

    /// Source read failed; playback cannot continue
    pub const DECODE_FAILED: i32 = 2002;

    /// Buffer pool needs at least two buffers
    pub const INVALID_BUFFER_COUNT: i32 = 2003;

    /// Configuration value out of range
    pub const INVALID_CONFIG: i32 = 2004;

    /// Operation requires a loaded file
    pub const NO_FILE_LOADED: i32 = 2005;

    /// File could not be opened
    pub const FILE_OPEN_FAILED: i32 = 2006;

    /// Stream format is not playable by the engine
    pub const UNSUPPORTED_FORMAT: i32 = 2007;

    /// Source could not be repositioned
    pub const SEEK_FAILED: i32 = 2008;

    /// Cycler did not acknowledge cancellation in time
    pub const CYCLER_UNRESPONSIVE: i32 = 2009;

    /// Failed to open audio output stream
    pub const STREAM_OPEN_FAILED: i32 = 2010;

    /// Hardware error occurred
    pub const HARDWARE_ERROR: i32 = 2011;

    /// Mutex/RwLock was poisoned
    pub const LOCK_POISONED: i32 = 2012;

    /// Background thread could not be spawned
    pub const THREAD_SPAWN_FAILED: i32 = 2013;

    /// Output backend already running
    pub const ALREADY_RUNNING: i32 = 2014;

    /// Output backend not running
    pub const NOT_RUNNING: i32 = 2015;
}

/// Log an audio error with structured context
///
/// This function logs audio errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - component: The component where the error occurred
/// - message: Human-readable error message
/// - context: Additional contextual information
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_audio_error(err: &AudioError, context: &str) {
    error!(
        "Audio error in {}: code={}, component=PlaybackEngine, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Playback engine errors
///
/// Underruns, superseded seeks and end of stream are deliberately absent:
/// they are reported through counters and events, not as failures.
///
/// Error code ranges: 2001-2015
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Buffer pool memory could not be reserved
    AllocationFailed { requested_frames: usize },

    /// Source read failed
    DecodeFailed { reason: String },

    /// Buffer pool needs at least two buffers
    InvalidBufferCount { count: usize },

    /// Configuration value out of range
    InvalidConfig { reason: String },

    /// Operation requires a loaded file
    NoFileLoaded,

    /// File could not be opened
    FileOpenFailed { path: String, reason: String },

    /// Stream format is not playable by the engine
    UnsupportedFormat { reason: String },

    /// Source could not be repositioned
    SeekFailed { sample_offset: u64, reason: String },

    /// Cycler did not acknowledge cancellation within the bound
    CyclerUnresponsive { waited_ms: u64 },

    /// Failed to open audio output stream
    StreamOpenFailed { reason: String },

    /// Hardware error occurred
    HardwareError { details: String },

    /// Mutex/RwLock was poisoned
    LockPoisoned { component: String },

    /// Background thread could not be spawned
    ThreadSpawnFailed { name: String, reason: String },

    /// Output backend already running
    AlreadyRunning,

    /// Output backend not running
    NotRunning,
}

impl AudioError {
    /// Whether the error ends the current playback session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AudioError::AllocationFailed { .. }
                | AudioError::DecodeFailed { .. }
                | AudioError::CyclerUnresponsive { .. }
                | AudioError::HardwareError { .. }
        )
    }
}

impl ErrorCode for AudioError {
    fn code(&self) -> i32 {
        match self {
            AudioError::AllocationFailed { .. } => AudioErrorCodes::ALLOCATION_FAILED,
            AudioError::DecodeFailed { .. } => AudioErrorCodes::DECODE_FAILED,
            AudioError::InvalidBufferCount { .. } => AudioErrorCodes::INVALID_BUFFER_COUNT,
            AudioError::InvalidConfig { .. } => AudioErrorCodes::INVALID_CONFIG,
            AudioError::NoFileLoaded => AudioErrorCodes::NO_FILE_LOADED,
            AudioError::FileOpenFailed { .. } => AudioErrorCodes::FILE_OPEN_FAILED,
            AudioError::UnsupportedFormat { .. } => AudioErrorCodes::UNSUPPORTED_FORMAT,
            AudioError::SeekFailed { .. } => AudioErrorCodes::SEEK_FAILED,
            AudioError::CyclerUnresponsive { .. } => AudioErrorCodes::CYCLER_UNRESPONSIVE,
            AudioError::StreamOpenFailed { .. } => AudioErrorCodes::STREAM_OPEN_FAILED,
            AudioError::HardwareError { .. } => AudioErrorCodes::HARDWARE_ERROR,
            AudioError::LockPoisoned { .. } => AudioErrorCodes::LOCK_POISONED,
            AudioError::ThreadSpawnFailed { .. } => AudioErrorCodes::THREAD_SPAWN_FAILED,
            AudioError::AlreadyRunning => AudioErrorCodes::ALREADY_RUNNING,
            AudioError::NotRunning => AudioErrorCodes::NOT_RUNNING,
        }
    }

    fn message(&self) -> String {
        match self {
            AudioError::AllocationFailed { requested_frames } => {
                format!(
                    "Could not reserve memory for {} buffered frames",
                    requested_frames
                )
            }
            AudioError::DecodeFailed { reason } => {
                format!("Failed to decode audio: {}", reason)
            }
            AudioError::InvalidBufferCount { count } => {
                format!("Buffer pool needs at least 2 buffers (got {})", count)
            }
            AudioError::InvalidConfig { reason } => {
                format!("Invalid configuration: {}", reason)
            }
            AudioError::NoFileLoaded => "No file loaded. Call load_file() first.".to_string(),
            AudioError::FileOpenFailed { path, reason } => {
                format!("Failed to open {}: {}", path, reason)
            }
            AudioError::UnsupportedFormat { reason } => {
                format!("Unsupported stream format: {}", reason)
            }
            AudioError::SeekFailed {
                sample_offset,
                reason,
            } => {
                format!("Failed to seek to sample {}: {}", sample_offset, reason)
            }
            AudioError::CyclerUnresponsive { waited_ms } => {
                format!(
                    "Buffer cycler did not acknowledge cancellation within {} ms",
                    waited_ms
                )
            }
            AudioError::StreamOpenFailed { reason } => {
                format!("Failed to open audio stream: {}", reason)
            }
            AudioError::HardwareError { details } => {
                format!("Hardware error: {}", details)
            }
            AudioError::LockPoisoned { component } => {
                format!("Lock poisoned on {}", component)
            }
            AudioError::ThreadSpawnFailed { name, reason } => {
                format!("Failed to spawn thread {}: {}", name, reason)
            }
            AudioError::AlreadyRunning => {
                "Audio output already running. Call stop() first.".to_string()
            }
            AudioError::NotRunning => "Audio output not running.".to_string(),
        }
    }
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AudioError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for AudioError {}

impl From<std::io::Error> for AudioError {
    fn from(err: std::io::Error) -> Self {
        AudioError::DecodeFailed {
            reason: err.to_string(),
        }
    }
}

impl From<hound::Error> for AudioError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::Unsupported | hound::Error::FormatError(_) => {
                AudioError::UnsupportedFormat {
                    reason: err.to_string(),
                }
            }
            other => AudioError::DecodeFailed {
                reason: other.to_string(),
            },
        }
    }
}
