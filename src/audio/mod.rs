// Audio module - buffer ring, frame sources and the real-time render path

pub mod buffer_pool;
pub mod callback;
pub mod cycler;
pub mod position;
pub mod seek;
pub mod session;
pub mod source;
pub mod time;
pub mod wav_source;

// Re-export commonly used types for convenience
pub use buffer_pool::{
    BufferPool, BufferState, PoolStatus, SoundBuffer, DEFAULT_BUFFER_COUNT, MIN_BUFFER_COUNT,
};
pub use callback::{RenderCallback, RenderEvent, RenderOutcome};
pub use cycler::{CyclerHandle, RingBufferCycler};
pub use position::PositionTracker;
pub use seek::{SeekController, SeekOutcome, SeekPhase};
pub use session::{PlaybackCursor, SessionShared};
pub use source::{
    FrameRead, FrameSource, MemoryFrameSource, SampleFormat, StreamDescriptor, TrackMetadata,
};
pub use time::MediaTime;
pub use wav_source::WavFrameSource;
