// Ring buffer cycler - background refill of vacated buffers
//
// Runs on its own thread and is the only context besides the seek controller
// that writes sample data. It is woken by the render callback whenever a buffer
// is vacated, and otherwise wakes on a fixed interval.
//
// Per wake:
// 1. Forward render-thread events (underruns, end of stream) to the event hub
// 2. If a seek asked for cancellation, acknowledge it and do nothing else
// 3. Fill Stale buffers in ring order until one is not Stale or the stream ends
// 4. Clear the cursor's refill request once the pass completes uncancelled

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtrb::Consumer;

use crate::audio::buffer_pool::BufferState;
use crate::audio::callback::RenderEvent;
use crate::audio::session::SessionShared;
use crate::audio::source::FrameSource;
use crate::error::{log_audio_error, AudioError};
use crate::telemetry::{EventHub, PlaybackState};

/// Per-fill scratch space for de-planarised source reads
pub(crate) struct FillScratch {
    left: Vec<f32>,
    right: Vec<f32>,
}

impl FillScratch {
    pub(crate) fn new(chunk_frames: usize) -> Self {
        let chunk_frames = chunk_frames.max(1);
        Self {
            left: vec![0.0; chunk_frames],
            right: vec![0.0; chunk_frames],
        }
    }

    fn chunk_frames(&self) -> usize {
        self.left.len()
    }
}

/// Result of one attempt to fill a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FillOutcome {
    Filled { frames: usize, is_final: bool },
    /// The buffer was not Stale; nothing written
    Busy,
    /// A seek cancelled the fill; the buffer is Stale again
    Cancelled,
}

/// Fill ring slot `index` from `source`
///
/// Claims the buffer (Stale -> Filling), reads in chunks of the scratch size
/// and publishes it (Filling -> Filled). When `cancellable`, the session's
/// cancellation token is checked before every sub-read. On error or
/// cancellation the buffer returns to Stale unpublished.
pub(crate) fn fill_buffer(
    shared: &SessionShared,
    source: &mut dyn FrameSource,
    index: usize,
    scratch: &mut FillScratch,
    cancellable: bool,
) -> Result<FillOutcome, AudioError> {
    let buffer = shared.pool.buffer_at(index);
    if !buffer.try_transition(BufferState::Stale, BufferState::Filling) {
        return Ok(FillOutcome::Busy);
    }

    let capacity = buffer.capacity();
    let stereo = buffer.channel_count() == 2;
    let mut produced = 0;
    let mut at_end = false;

    while produced < capacity {
        if cancellable && shared.cancel_requested.load(Ordering::SeqCst) {
            buffer.set_state(BufferState::Stale);
            return Ok(FillOutcome::Cancelled);
        }

        let want = (capacity - produced).min(scratch.chunk_frames());
        let right = if stereo {
            Some(&mut scratch.right[..want])
        } else {
            None
        };
        let read = match source.read_frames(&mut scratch.left[..want], right, want) {
            Ok(read) => read,
            Err(err) => {
                buffer.set_state(BufferState::Stale);
                return Err(err);
            }
        };

        let frames = read.frames.min(want);
        buffer.write_channel(0, produced, &scratch.left[..frames]);
        if stereo {
            buffer.write_channel(1, produced, &scratch.right[..frames]);
        }
        produced += frames;

        if read.at_end {
            at_end = true;
            break;
        }
        if frames == 0 {
            tracing::warn!(
                "[Cycler] Source returned no frames without signalling end; treating as end of stream"
            );
            at_end = true;
            break;
        }
    }

    buffer.zero_from(produced);
    let logical_index = shared.next_logical_index.fetch_add(1, Ordering::Relaxed);
    buffer.publish(logical_index, produced, at_end);
    if at_end {
        shared.final_buffer_reached.store(true, Ordering::Release);
        tracing::debug!(
            "[Cycler] Final buffer {} (logical {}) holds {} of {} frames",
            index,
            logical_index,
            produced,
            capacity
        );
    }

    Ok(FillOutcome::Filled {
        frames: produced,
        is_final: at_end,
    })
}

/// Background refill task for one session
pub struct RingBufferCycler {
    shared: Arc<SessionShared>,
    hub: Arc<EventHub>,
    events: Consumer<RenderEvent>,
    scratch: FillScratch,
    interval: Duration,
}

impl RingBufferCycler {
    pub fn new(
        shared: Arc<SessionShared>,
        hub: Arc<EventHub>,
        events: Consumer<RenderEvent>,
        fill_chunk_frames: usize,
        interval: Duration,
    ) -> Self {
        Self {
            shared,
            hub,
            events,
            scratch: FillScratch::new(fill_chunk_frames),
            interval,
        }
    }

    /// Start the cycler on a thread named `pcm-cycler`
    pub fn spawn(self) -> Result<CyclerHandle, AudioError> {
        let shared = Arc::clone(&self.shared);
        shared.cycler_running.store(true, Ordering::SeqCst);

        let join = thread::Builder::new()
            .name("pcm-cycler".to_string())
            .spawn(move || self.run())
            .map_err(|err| {
                shared.cycler_running.store(false, Ordering::SeqCst);
                AudioError::ThreadSpawnFailed {
                    name: "pcm-cycler".to_string(),
                    reason: err.to_string(),
                }
            })?;

        shared.register_cycler(join.thread().clone());
        shared.wake_cycler();

        Ok(CyclerHandle {
            shared,
            join: Some(join),
        })
    }

    fn run(mut self) {
        tracing::info!("[Cycler] Starting fill loop");

        while !self.shared.shutdown.load(Ordering::Acquire) {
            let filled = self.cycle();
            if filled == 0 {
                thread::park_timeout(self.interval);
            }
        }

        self.drain_render_events();
        self.shared.cycler_running.store(false, Ordering::SeqCst);
        tracing::info!("[Cycler] Fill loop stopped");
    }

    /// One wake: returns the number of buffers filled
    pub(crate) fn cycle(&mut self) -> usize {
        self.drain_render_events();

        if self.shared.cancel_requested.load(Ordering::SeqCst) {
            self.shared.cancel_acknowledged.store(true, Ordering::SeqCst);
            return 0;
        }
        if self.shared.has_failed() {
            return 0;
        }

        let filled = match self.fill_vacated() {
            Ok(filled) => filled,
            Err(err) => {
                self.fail(err);
                return 0;
            }
        };

        if self.shared.cancel_requested.load(Ordering::SeqCst) {
            // The vacated buffer may still be Stale; leave the request set.
            self.shared.cancel_acknowledged.store(true, Ordering::SeqCst);
        } else {
            // Ring topped up or final buffer reached.
            self.shared.cursor.clear_refill();
        }
        filled
    }

    fn fill_vacated(&mut self) -> Result<usize, AudioError> {
        let shared = Arc::clone(&self.shared);
        let pool_len = shared.pool.len();
        let mut filled = 0;

        let mut guard = shared.lock_source()?;
        let Some(source) = guard.as_mut() else {
            return Ok(0);
        };

        // At most one lap: every buffer filled means the ring is full.
        while filled < pool_len {
            if shared.final_buffer_reached.load(Ordering::Acquire) {
                break;
            }
            let index = shared.next_fill.load(Ordering::Relaxed);
            match fill_buffer(&shared, source.as_mut(), index, &mut self.scratch, true)? {
                FillOutcome::Filled { .. } => {
                    shared
                        .next_fill
                        .store(shared.pool.next_index(index), Ordering::Relaxed);
                    filled += 1;
                }
                FillOutcome::Busy | FillOutcome::Cancelled => break,
            }
        }

        Ok(filled)
    }

    fn drain_render_events(&mut self) {
        while let Ok(event) = self.events.pop() {
            match event {
                RenderEvent::Underrun { frames } => {
                    tracing::debug!("[Cycler] Render underrun: {} silent frames", frames);
                    self.hub.underrun(frames);
                }
                RenderEvent::Ended => {
                    // A seek may already have rewound the session.
                    if !self.shared.has_ended() {
                        continue;
                    }
                    tracing::info!("[Cycler] Playback reached end of stream");
                    self.shared.set_playing(false);
                    // Idle first: an end hook that restarts playback must win.
                    self.hub.set_state(PlaybackState::Idle);
                    self.hub.playback_ended();
                }
            }
        }
    }

    fn fail(&self, err: AudioError) {
        log_audio_error(&err, "cycler_fill");
        self.shared.record_failure(err.clone());
        self.hub.fail(&err);
    }
}

/// Owner-side handle to a running cycler
pub struct CyclerHandle {
    shared: Arc<SessionShared>,
    join: Option<JoinHandle<()>>,
}

impl CyclerHandle {
    /// Stop the loop and join the thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        join.thread().unpark();
        if join.join().is_err() {
            log::error!("[Cycler] Thread panicked");
        }
    }
}

impl Drop for CyclerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer_pool::BufferPool;
    use crate::audio::position::PositionTracker;
    use crate::audio::source::MemoryFrameSource;
    use crate::testing::{ramp_source, FailingSource};

    fn session(
        source: Box<dyn FrameSource>,
        buffers: usize,
        frames: usize,
    ) -> Arc<SessionShared> {
        let channels = usize::from(source.descriptor().channel_count);
        let total = source.descriptor().total_frames;
        let rate = source.descriptor().sample_rate;
        let pool = Arc::new(BufferPool::new(buffers, frames, channels).unwrap());
        Arc::new(SessionShared::new(
            pool,
            PositionTracker::new(rate, total, 0),
            source,
        ))
    }

    fn cycler(
        shared: &Arc<SessionShared>,
        hub: &Arc<EventHub>,
    ) -> (RingBufferCycler, rtrb::Producer<RenderEvent>) {
        let (producer, consumer) = rtrb::RingBuffer::new(8);
        let cycler = RingBufferCycler::new(
            Arc::clone(shared),
            Arc::clone(hub),
            consumer,
            256,
            Duration::from_millis(5),
        );
        (cycler, producer)
    }

    #[test]
    fn fill_splits_stream_into_buffers() {
        let shared = session(Box::new(ramp_source(44100, 5000, 1).unwrap()), 5, 1024);
        let hub = Arc::new(EventHub::default());
        let (mut cycler, _events) = cycler(&shared, &hub);

        assert_eq!(cycler.cycle(), 5);

        let pool = shared.pool();
        let sizes: Vec<usize> = (0..5).map(|i| pool.buffer_at(i).valid_frames()).collect();
        assert_eq!(sizes, vec![1024, 1024, 1024, 1024, 904]);
        assert!(pool.buffer_at(4).is_final());
        assert_eq!(pool.buffer_at(4).read_sample(0, 903), 4999.0);
        assert_eq!(pool.buffer_at(4).read_sample(0, 904), 0.0);
        assert!(shared.final_buffer_reached.load(Ordering::Acquire));

        let logical: Vec<u64> = (0..5).map(|i| pool.buffer_at(i).logical_index()).collect();
        assert_eq!(logical, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fill_stops_at_unconsumed_buffer() {
        let shared = session(Box::new(ramp_source(44100, 100_000, 2).unwrap()), 3, 512);
        let hub = Arc::new(EventHub::default());
        let (mut cycler, _events) = cycler(&shared, &hub);

        assert_eq!(cycler.cycle(), 3);
        assert_eq!(cycler.cycle(), 0, "Full ring must not be refilled");
        assert_eq!(shared.pool().status().filled, 3);

        shared.pool().buffer_at(0).set_state(BufferState::Stale);
        shared.cursor().request_refill();
        assert_eq!(cycler.cycle(), 1);
        assert!(!shared.cursor().refill_requested());
        assert_eq!(shared.pool().buffer_at(0).logical_index(), 3);
        assert_eq!(shared.pool().buffer_at(0).read_sample(1, 0), -1536.0);
    }

    #[test]
    fn cancellation_is_acknowledged_without_filling() {
        let shared = session(Box::new(ramp_source(44100, 10_000, 1).unwrap()), 3, 512);
        let hub = Arc::new(EventHub::default());
        let (mut cycler, _events) = cycler(&shared, &hub);

        shared.cancel_requested.store(true, Ordering::SeqCst);
        assert_eq!(cycler.cycle(), 0);
        assert!(shared.cancel_acknowledged.load(Ordering::SeqCst));
        assert_eq!(shared.pool().status().stale, 3);
    }

    #[test]
    fn cancelled_pass_keeps_refill_request() {
        let shared = session(Box::new(ramp_source(44100, 10_000, 1).unwrap()), 3, 512);
        let hub = Arc::new(EventHub::default());
        let (mut cycler, _events) = cycler(&shared, &hub);

        shared.cursor().request_refill();
        shared.cancel_requested.store(true, Ordering::SeqCst);
        assert_eq!(cycler.cycle(), 0);
        assert!(shared.cursor().refill_requested());

        shared.cancel_requested.store(false, Ordering::SeqCst);
        assert_eq!(cycler.cycle(), 3);
        assert!(!shared.cursor().refill_requested());
    }

    #[test]
    fn cancelled_fill_leaves_buffer_stale() {
        let shared = session(Box::new(ramp_source(44100, 10_000, 1).unwrap()), 3, 512);
        let mut scratch = FillScratch::new(64);
        shared.cancel_requested.store(true, Ordering::SeqCst);

        let mut guard = shared.lock_source().unwrap();
        let source = guard.as_mut().unwrap();
        let outcome = fill_buffer(&shared, source.as_mut(), 0, &mut scratch, true).unwrap();
        assert_eq!(outcome, FillOutcome::Cancelled);
        assert_eq!(shared.pool().buffer_at(0).state(), BufferState::Stale);

        let outcome = fill_buffer(&shared, source.as_mut(), 0, &mut scratch, false).unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled {
                frames: 512,
                is_final: false
            }
        );
    }

    #[test]
    fn exact_multiple_ends_on_full_buffer() {
        let shared = session(Box::new(ramp_source(8000, 1024, 1).unwrap()), 3, 512);
        let hub = Arc::new(EventHub::default());
        let (mut cycler, _events) = cycler(&shared, &hub);

        assert_eq!(cycler.cycle(), 2);
        assert!(shared.pool().buffer_at(1).is_final());
        assert_eq!(shared.pool().buffer_at(1).valid_frames(), 512);
        assert_eq!(shared.pool().buffer_at(2).state(), BufferState::Stale);
    }

    #[test]
    fn decode_error_fails_session() {
        let shared = session(Box::new(FailingSource::new(44100, 1, 700).unwrap()), 3, 512);
        let hub = Arc::new(EventHub::default());
        let mut rx = hub.subscribe();
        let (mut cycler, _events) = cycler(&shared, &hub);
        shared.set_playing(true);

        assert_eq!(cycler.cycle(), 0);
        assert_eq!(shared.pool().buffer_at(0).state(), BufferState::Filled);
        assert!(shared.has_failed());
        assert!(!shared.is_playing());
        assert_eq!(hub.state(), PlaybackState::Failed);
        assert_eq!(
            shared.pool().buffer_at(1).state(),
            BufferState::Stale,
            "Failed fill must not publish"
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            crate::telemetry::PlaybackEvent::Error { .. }
        ));
    }

    #[test]
    fn ended_event_dispatched_from_cycler() {
        let source = MemoryFrameSource::new(8000, vec![vec![0.5; 10]]).unwrap();
        let shared = session(Box::new(source), 2, 16);
        let hub = Arc::new(EventHub::default());
        let (mut cycler, mut events) = cycler(&shared, &hub);
        let mut rx = hub.subscribe();

        shared.ended.store(true, Ordering::Release);
        events.push(RenderEvent::Underrun { frames: 6 }).unwrap();
        events.push(RenderEvent::Ended).unwrap();
        cycler.cycle();

        assert_eq!(
            rx.try_recv().unwrap(),
            crate::telemetry::PlaybackEvent::Underrun { frames: 6 }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::telemetry::PlaybackEvent::StateChanged {
                state: PlaybackState::Idle
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::telemetry::PlaybackEvent::PlaybackEnded
        );
    }

    #[test]
    fn spawned_cycler_primes_ring() {
        let shared = session(Box::new(ramp_source(44100, 50_000, 2).unwrap()), 3, 1024);
        let hub = Arc::new(EventHub::default());
        let (cycler, _events) = cycler(&shared, &hub);

        let handle = cycler.spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while shared.pool().status().filled < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(shared.pool().status().filled, 3);

        handle.shutdown();
        assert!(!shared.has_cycler());
    }
}
