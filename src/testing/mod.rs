//! Deterministic frame sources for exercising the engine without a decoder.
//!
//! Ramps make every sample identify its own frame index, so a test can tell
//! from rendered output alone whether a frame was skipped, duplicated or
//! taken from a stale buffer. The wrappers add the timing hazards playback
//! has to survive: slow reads, seeks held mid-flight and read failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::callback::RenderOutcome;
use crate::audio::source::{
    FrameRead, FrameSource, MemoryFrameSource, StreamDescriptor, TrackMetadata,
};
use crate::engine::{DesktopStubBackend, PlaybackEngine};
use crate::error::AudioError;

/// Source whose left sample at frame `i` is `i` and right sample is `-i`
///
/// Values are exact for streams shorter than 2^24 frames.
pub fn ramp_source(
    sample_rate: u32,
    frames: usize,
    channels: usize,
) -> Result<MemoryFrameSource, AudioError> {
    let left: Vec<f32> = (0..frames).map(|i| i as f32).collect();
    let mut planes = vec![left];
    if channels > 1 {
        planes.push((0..frames).map(|i| -(i as f32)).collect());
    }
    Ok(MemoryFrameSource::new(sample_rate, planes)?.with_title("ramp"))
}

/// Adjustable per-read delay shared between a [`SlowSource`] and the test
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    delay_us: Arc<AtomicU64>,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        let throttle = Self::default();
        throttle.set_delay(delay);
        throttle
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us.load(Ordering::Relaxed))
    }
}

/// Wrapper that sleeps before every read, starving the ring
pub struct SlowSource<S> {
    inner: S,
    throttle: Throttle,
}

impl<S: FrameSource> SlowSource<S> {
    pub fn new(inner: S, delay: Duration) -> (Self, Throttle) {
        let throttle = Throttle::new(delay);
        (
            Self {
                inner,
                throttle: throttle.clone(),
            },
            throttle,
        )
    }
}

impl<S: FrameSource> FrameSource for SlowSource<S> {
    fn descriptor(&self) -> &StreamDescriptor {
        self.inner.descriptor()
    }

    fn read_frames(
        &mut self,
        left: &mut [f32],
        right: Option<&mut [f32]>,
        max_frames: usize,
    ) -> Result<FrameRead, AudioError> {
        let delay = self.throttle.delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.inner.read_frames(left, right, max_frames)
    }

    fn seek(&mut self, sample_offset: u64) -> Result<(), AudioError> {
        self.inner.seek(sample_offset)
    }

    fn metadata(&self) -> TrackMetadata {
        self.inner.metadata()
    }
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    blocked: usize,
    offsets: Vec<u64>,
}

/// Test-side control of a [`GatedSource`]
#[derive(Debug, Default)]
pub struct SeekGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl SeekGate {
    const WAIT_LIMIT: Duration = Duration::from_secs(5);

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent seeks block until `open`
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn open(&self) {
        self.lock().closed = false;
        self.changed.notify_all();
    }

    /// Wait until a seek is parked at the gate; false after five seconds
    pub fn wait_for_blocked_seek(&self) -> bool {
        let deadline = Instant::now() + Self::WAIT_LIMIT;
        let mut state = self.lock();
        while state.blocked == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Every offset the source was asked to seek to, in order
    pub fn seek_offsets(&self) -> Vec<u64> {
        self.lock().offsets.clone()
    }

    fn pass(&self, sample_offset: u64) {
        let mut state = self.lock();
        state.offsets.push(sample_offset);
        if !state.closed {
            return;
        }
        state.blocked += 1;
        self.changed.notify_all();
        let deadline = Instant::now() + Self::WAIT_LIMIT;
        while state.closed && Instant::now() < deadline {
            state = self
                .changed
                .wait_timeout(state, Self::WAIT_LIMIT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.blocked -= 1;
    }
}

/// Wrapper whose `seek` can be held open, freezing a seek mid-reposition
pub struct GatedSource<S> {
    inner: S,
    gate: Arc<SeekGate>,
}

impl<S: FrameSource> GatedSource<S> {
    pub fn new(inner: S) -> (Self, Arc<SeekGate>) {
        let gate = Arc::new(SeekGate::default());
        (
            Self {
                inner,
                gate: Arc::clone(&gate),
            },
            gate,
        )
    }
}

impl<S: FrameSource> FrameSource for GatedSource<S> {
    fn descriptor(&self) -> &StreamDescriptor {
        self.inner.descriptor()
    }

    fn read_frames(
        &mut self,
        left: &mut [f32],
        right: Option<&mut [f32]>,
        max_frames: usize,
    ) -> Result<FrameRead, AudioError> {
        self.inner.read_frames(left, right, max_frames)
    }

    fn seek(&mut self, sample_offset: u64) -> Result<(), AudioError> {
        self.gate.pass(sample_offset);
        self.inner.seek(sample_offset)
    }

    fn metadata(&self) -> TrackMetadata {
        self.inner.metadata()
    }
}

#[derive(Debug, Default)]
struct ReadGateState {
    /// Reads still allowed through before the gate shuts
    countdown: Option<usize>,
    closed: bool,
    blocked: usize,
    reads: usize,
}

/// Test-side control of a [`ReadGatedSource`]
#[derive(Debug, Default)]
pub struct ReadGate {
    state: Mutex<ReadGateState>,
    changed: Condvar,
}

impl ReadGate {
    const WAIT_LIMIT: Duration = Duration::from_secs(5);

    fn lock(&self) -> MutexGuard<'_, ReadGateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let `reads` more reads through, then block the next one until `open`
    pub fn hold_after(&self, reads: usize) {
        let mut state = self.lock();
        state.countdown = Some(reads);
        state.closed = false;
    }

    pub fn open(&self) {
        let mut state = self.lock();
        state.countdown = None;
        state.closed = false;
        drop(state);
        self.changed.notify_all();
    }

    /// Wait until a read is parked at the gate; false after five seconds
    pub fn wait_for_blocked_read(&self) -> bool {
        let deadline = Instant::now() + Self::WAIT_LIMIT;
        let mut state = self.lock();
        while state.blocked == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Reads started so far, including a blocked one
    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    fn pass(&self) {
        let mut state = self.lock();
        state.reads += 1;
        match state.countdown {
            Some(0) => {
                state.countdown = None;
                state.closed = true;
            }
            Some(left) => {
                state.countdown = Some(left - 1);
                return;
            }
            None => return,
        }

        state.blocked += 1;
        self.changed.notify_all();
        let deadline = Instant::now() + Self::WAIT_LIMIT;
        while state.closed && Instant::now() < deadline {
            state = self
                .changed
                .wait_timeout(state, Self::WAIT_LIMIT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.blocked -= 1;
    }
}

/// Wrapper whose `read_frames` can be held open, freezing a fill mid-buffer
pub struct ReadGatedSource<S> {
    inner: S,
    gate: Arc<ReadGate>,
}

impl<S: FrameSource> ReadGatedSource<S> {
    pub fn new(inner: S) -> (Self, Arc<ReadGate>) {
        let gate = Arc::new(ReadGate::default());
        (
            Self {
                inner,
                gate: Arc::clone(&gate),
            },
            gate,
        )
    }
}

impl<S: FrameSource> FrameSource for ReadGatedSource<S> {
    fn descriptor(&self) -> &StreamDescriptor {
        self.inner.descriptor()
    }

    fn read_frames(
        &mut self,
        left: &mut [f32],
        right: Option<&mut [f32]>,
        max_frames: usize,
    ) -> Result<FrameRead, AudioError> {
        self.gate.pass();
        self.inner.read_frames(left, right, max_frames)
    }

    fn seek(&mut self, sample_offset: u64) -> Result<(), AudioError> {
        self.inner.seek(sample_offset)
    }

    fn metadata(&self) -> TrackMetadata {
        self.inner.metadata()
    }
}

/// Ramp source that fails with `DecodeFailed` once `fail_after` frames are read
pub struct FailingSource {
    inner: MemoryFrameSource,
    position: u64,
    fail_after: u64,
}

impl FailingSource {
    /// Reports twice `fail_after` frames so the failure lands mid-stream
    pub fn new(sample_rate: u32, channels: usize, fail_after: usize) -> Result<Self, AudioError> {
        Ok(Self {
            inner: ramp_source(sample_rate, fail_after.saturating_mul(2), channels)?,
            position: 0,
            fail_after: fail_after as u64,
        })
    }
}

impl FrameSource for FailingSource {
    fn descriptor(&self) -> &StreamDescriptor {
        self.inner.descriptor()
    }

    fn read_frames(
        &mut self,
        left: &mut [f32],
        right: Option<&mut [f32]>,
        max_frames: usize,
    ) -> Result<FrameRead, AudioError> {
        if self.position >= self.fail_after {
            return Err(AudioError::DecodeFailed {
                reason: format!("corrupt block at frame {}", self.position),
            });
        }
        let allowed = (self.fail_after - self.position) as usize;
        let read = self
            .inner
            .read_frames(left, right, max_frames.min(allowed))?;
        self.position += read.frames as u64;
        Ok(read)
    }

    fn seek(&mut self, sample_offset: u64) -> Result<(), AudioError> {
        self.inner.seek(sample_offset)?;
        self.position = sample_offset;
        Ok(())
    }
}

/// Real frames captured by [`render_until_end`]
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    /// Render calls that hit an unfilled buffer
    pub underrun_calls: usize,
    pub ended: bool,
}

/// Act as the hardware: pump `backend` in `slice_frames` calls until the stream ends
///
/// Only frames that advanced the engine's position are captured, so silence
/// from underruns and pauses never shows up in the output. Gives up after
/// `limit` with `ended == false`.
pub fn render_until_end(
    engine: &PlaybackEngine,
    backend: &DesktopStubBackend,
    slice_frames: usize,
    limit: Duration,
) -> Result<Capture, AudioError> {
    let deadline = Instant::now() + limit;
    let mut capture = Capture::default();

    while Instant::now() < deadline {
        let before = engine.frames_buffered().value;
        let block = backend.render(slice_frames)?;
        let advanced = engine.frames_buffered().value.saturating_sub(before);
        let real = usize::try_from(advanced).unwrap_or(0).min(slice_frames);
        capture.left.extend_from_slice(&block.left[..real]);
        capture.right.extend_from_slice(&block.right[..real]);

        match block.outcome {
            RenderOutcome::Rendered => {}
            RenderOutcome::Ended => {
                capture.ended = true;
                break;
            }
            RenderOutcome::Underrun { .. } => {
                capture.underrun_calls += 1;
                thread::sleep(Duration::from_micros(200));
            }
            RenderOutcome::Silent => thread::sleep(Duration::from_micros(200)),
        }
    }
    Ok(capture)
}

/// Poll `condition` every millisecond for up to `limit`
pub fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
