// Session state shared by the render callback, the cycler and the seek controller
//
// Everything the render callback reads lives in atomics. The frame source sits
// behind a mutex that only the cycler and the control thread ever take.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::Thread;

use crate::audio::buffer_pool::BufferPool;
use crate::audio::position::PositionTracker;
use crate::audio::source::FrameSource;
use crate::error::AudioError;

/// Read position of the render callback
///
/// Written by the render callback; reset by the seek controller while the
/// callback is held off.
#[derive(Debug, Default)]
pub struct PlaybackCursor {
    current_buffer: AtomicUsize,
    read_offset: AtomicUsize,
    refill_requested: AtomicBool,
}

impl PlaybackCursor {
    pub fn current_buffer(&self) -> usize {
        self.current_buffer.load(Ordering::Relaxed)
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset.load(Ordering::Relaxed)
    }

    pub(crate) fn store(&self, buffer: usize, offset: usize) {
        self.current_buffer.store(buffer, Ordering::Relaxed);
        self.read_offset.store(offset, Ordering::Relaxed);
    }

    pub fn refill_requested(&self) -> bool {
        self.refill_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_refill(&self) {
        self.refill_requested.store(true, Ordering::Release);
    }

    pub(crate) fn clear_refill(&self) {
        self.refill_requested.store(false, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.store(0, 0);
        self.clear_refill();
    }
}

pub(crate) type SharedSource = Option<Box<dyn FrameSource>>;

/// State of one playback session
pub struct SessionShared {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) cursor: PlaybackCursor,
    pub(crate) position: PositionTracker,

    pub(crate) playing: AtomicBool,
    pub(crate) ended: AtomicBool,
    pub(crate) failed: AtomicBool,
    pub(crate) final_buffer_reached: AtomicBool,
    pub(crate) shutdown: AtomicBool,

    // Seek handshake. `seeking` and `render_active` form a SeqCst pair: either
    // the callback sees `seeking` and stays out, or the seek controller sees
    // `render_active` and waits for it to clear.
    pub(crate) seeking: AtomicBool,
    pub(crate) render_active: AtomicBool,
    pub(crate) cancel_requested: AtomicBool,
    pub(crate) cancel_acknowledged: AtomicBool,

    /// Next ring index the cycler will fill
    pub(crate) next_fill: AtomicUsize,
    pub(crate) next_logical_index: AtomicU64,
    pub(crate) underruns: AtomicU64,

    cycler: OnceLock<Thread>,
    pub(crate) cycler_running: AtomicBool,

    source: Mutex<SharedSource>,
    failure: Mutex<Option<AudioError>>,
}

impl SessionShared {
    pub fn new(
        pool: Arc<BufferPool>,
        position: PositionTracker,
        source: Box<dyn FrameSource>,
    ) -> Self {
        Self {
            pool,
            cursor: PlaybackCursor::default(),
            position,
            playing: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            final_buffer_reached: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            seeking: AtomicBool::new(false),
            render_active: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            cancel_acknowledged: AtomicBool::new(false),
            next_fill: AtomicUsize::new(0),
            next_logical_index: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            cycler: OnceLock::new(),
            cycler_running: AtomicBool::new(false),
            source: Mutex::new(Some(source)),
            failure: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn cursor(&self) -> &PlaybackCursor {
        &self.cursor
    }

    pub fn position(&self) -> &PositionTracker {
        &self.position
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub(crate) fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    pub(crate) fn register_cycler(&self, thread: Thread) {
        // Only the first registration counts; a session has one cycler.
        let _ = self.cycler.set(thread);
    }

    pub(crate) fn has_cycler(&self) -> bool {
        self.cycler_running.load(Ordering::SeqCst)
    }

    /// Unpark the cycler thread, if one has been spawned
    pub(crate) fn wake_cycler(&self) {
        if let Some(thread) = self.cycler.get() {
            thread.unpark();
        }
    }

    pub(crate) fn lock_source(&self) -> Result<MutexGuard<'_, SharedSource>, AudioError> {
        self.source.lock().map_err(|_| AudioError::LockPoisoned {
            component: "frame_source".to_string(),
        })
    }

    /// Hand the source back to the engine at the end of the session
    pub(crate) fn take_source(&self) -> Option<Box<dyn FrameSource>> {
        match self.source.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Record a fatal error and silence the session
    pub(crate) fn record_failure(&self, err: AudioError) {
        self.playing.store(false, Ordering::Release);
        self.failed.store(true, Ordering::Release);
        match self.failure.lock() {
            Ok(mut slot) => *slot = Some(err),
            Err(poisoned) => *poisoned.into_inner() = Some(err),
        }
    }

    pub fn failure(&self) -> Option<AudioError> {
        match self.failure.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::MemoryFrameSource;

    fn shared() -> SessionShared {
        let pool = Arc::new(BufferPool::new(3, 16, 1).unwrap());
        let source = MemoryFrameSource::new(8000, vec![vec![0.0; 100]]).unwrap();
        let position = PositionTracker::new(8000, 100, 0);
        SessionShared::new(pool, position, Box::new(source))
    }

    #[test]
    fn test_cursor_reset() {
        let cursor = PlaybackCursor::default();
        cursor.store(2, 10);
        cursor.request_refill();
        assert!(cursor.refill_requested());

        cursor.reset();
        assert_eq!(cursor.current_buffer(), 0);
        assert_eq!(cursor.read_offset(), 0);
        assert!(!cursor.refill_requested());
    }

    #[test]
    fn test_failure_silences_session() {
        let shared = shared();
        shared.set_playing(true);
        shared.record_failure(AudioError::DecodeFailed {
            reason: "corrupt".to_string(),
        });

        assert!(!shared.is_playing());
        assert!(shared.has_failed());
        assert!(matches!(
            shared.failure(),
            Some(AudioError::DecodeFailed { .. })
        ));
    }

    #[test]
    fn test_take_source_once() {
        let shared = shared();
        assert!(shared.take_source().is_some());
        assert!(shared.take_source().is_none());
        assert!(shared.lock_source().unwrap().is_none());
    }

    #[test]
    fn test_wake_without_cycler_is_noop() {
        let shared = shared();
        assert!(!shared.has_cycler());
        shared.wake_cycler();
    }
}
