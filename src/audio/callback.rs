//! Render callback - the real-time consumer of the buffer ring
//!
//! Invoked by the output backend on the audio thread with a fixed frame count
//! per call. Every call completes in bounded time:
//! - No heap allocations
//! - No locks (atomics only)
//! - No I/O; events for the outside world go through a wait-free `rtrb` queue
//!
//! # Architecture
//! ```text
//! OutputBackend::start()
//!   └─> RenderCallback::render_interleaved() [Real-time thread]
//!       ├─> Filled -> Reading on entering a buffer
//!       ├─> copy samples, advance cursor and position
//!       ├─> Reading -> Stale on leaving a buffer, unpark cycler
//!       └─> silence on underrun / pause / seek / end of stream
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rtrb::Producer;

use crate::audio::buffer_pool::BufferState;
use crate::audio::session::SessionShared;

/// Notifications from the render thread, consumed by the cycler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    Underrun { frames: usize },
    Ended,
}

/// What a single render call produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Every requested frame came from the ring
    Rendered,
    /// The next buffer was not ready; the tail of the call is silence
    Underrun { silent_frames: usize },
    /// The final buffer ran out during this call
    Ended,
    /// Paused, seeking, ended or failed: the whole call is silence
    Silent,
}

/// Real-time side of a playback session
///
/// Owned by the output backend for the lifetime of the stream.
pub struct RenderCallback {
    session: Arc<SessionShared>,
    events: Producer<RenderEvent>,
}

impl RenderCallback {
    pub fn new(session: Arc<SessionShared>, events: Producer<RenderEvent>) -> Self {
        Self { session, events }
    }

    pub fn session(&self) -> &Arc<SessionShared> {
        &self.session
    }

    /// Channel count of the source feeding this callback
    pub fn source_channels(&self) -> usize {
        self.session.pool.channel_count()
    }

    /// Render into an interleaved output slice with `output_channels` channels
    ///
    /// Mono sources go to every output channel. Stereo sources fill the first
    /// two channels and leave the rest silent; a mono device gets the average.
    pub fn render_interleaved(
        &mut self,
        output: &mut [f32],
        output_channels: usize,
    ) -> RenderOutcome {
        if output_channels == 0 {
            return RenderOutcome::Silent;
        }
        let frames = output.len() / output_channels;
        let mono_source = self.source_channels() < 2;

        self.render_frames(frames, |frame, left, right| {
            let slot = &mut output[frame * output_channels..(frame + 1) * output_channels];
            match (output_channels, mono_source) {
                (1, true) => slot[0] = left,
                (1, false) => slot[0] = 0.5 * (left + right),
                (_, true) => slot.fill(left),
                (_, false) => {
                    slot[0] = left;
                    slot[1] = right;
                    slot[2..].fill(0.0);
                }
            }
        })
    }

    /// Produce `frames` frames, handing each to `writer(frame, left, right)`
    ///
    /// For mono sources `right` equals `left`.
    pub fn render_frames<W>(&mut self, frames: usize, mut writer: W) -> RenderOutcome
    where
        W: FnMut(usize, f32, f32),
    {
        let session = Arc::clone(&self.session);

        // Pairs with the seek controller's SeqCst store of `seeking`.
        session.render_active.store(true, Ordering::SeqCst);
        if session.seeking.load(Ordering::SeqCst)
            || !session.playing.load(Ordering::Acquire)
            || session.ended.load(Ordering::Acquire)
            || session.pool.is_empty()
        {
            session.render_active.store(false, Ordering::SeqCst);
            write_silence(&mut writer, 0, frames);
            return RenderOutcome::Silent;
        }

        let outcome = self.render_from_ring(&session, frames, &mut writer);
        session.render_active.store(false, Ordering::SeqCst);
        outcome
    }

    fn render_from_ring<W>(
        &mut self,
        session: &SessionShared,
        frames: usize,
        writer: &mut W,
    ) -> RenderOutcome
    where
        W: FnMut(usize, f32, f32),
    {
        let pool = &session.pool;
        let stereo = pool.channel_count() == 2;
        let mut index = session.cursor.current_buffer();
        let mut offset = session.cursor.read_offset();
        let mut written = 0;
        let mut outcome = RenderOutcome::Rendered;

        while written < frames {
            let buffer = pool.buffer_at(index);

            if buffer.state() != BufferState::Reading
                && !buffer.try_transition(BufferState::Filled, BufferState::Reading)
            {
                let silent_frames = frames - written;
                write_silence(writer, written, frames);
                session.underruns.fetch_add(1, Ordering::Relaxed);
                // Keep one slot free so the end-of-stream event always fits.
                if self.events.slots() > 1 {
                    let _ = self.events.push(RenderEvent::Underrun {
                        frames: silent_frames,
                    });
                }
                session.wake_cycler();
                outcome = RenderOutcome::Underrun { silent_frames };
                break;
            }

            let valid = buffer.valid_frames();
            let count = valid.saturating_sub(offset).min(frames - written);
            for i in 0..count {
                let left = buffer.read_sample(0, offset + i);
                let right = if stereo {
                    buffer.read_sample(1, offset + i)
                } else {
                    left
                };
                writer(written + i, left, right);
            }
            written += count;
            offset += count;
            session.position.increment_frames_elapsed(count);

            if offset < valid {
                continue;
            }

            if buffer.is_final() {
                write_silence(writer, written, frames);
                buffer.set_state(BufferState::Stale);
                offset = 0;
                session.ended.store(true, Ordering::Release);
                let _ = self.events.push(RenderEvent::Ended);
                session.wake_cycler();
                outcome = RenderOutcome::Ended;
                break;
            }

            // Vacate and hand the buffer back to the cycler.
            buffer.set_state(BufferState::Stale);
            session.cursor.request_refill();
            session.wake_cycler();
            index = pool.next_index(index);
            offset = 0;
        }

        session.cursor.store(index, offset);
        outcome
    }
}

#[inline]
fn write_silence<W: FnMut(usize, f32, f32)>(writer: &mut W, from: usize, to: usize) {
    for frame in from..to {
        writer(frame, 0.0, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer_pool::BufferPool;
    use crate::audio::position::PositionTracker;
    use crate::testing::ramp_source;

    fn session(buffers: usize, frames: usize, channels: usize) -> Arc<SessionShared> {
        let pool = Arc::new(BufferPool::new(buffers, frames, channels).unwrap());
        Arc::new(SessionShared::new(
            pool,
            PositionTracker::new(1000, 1_000_000, 0),
            Box::new(ramp_source(1000, 1_000_000, channels).unwrap()),
        ))
    }

    fn publish_ramp(
        shared: &SessionShared,
        index: usize,
        start: f32,
        valid: usize,
        is_final: bool,
    ) {
        let buffer = shared.pool().buffer_at(index);
        let left: Vec<f32> = (0..valid).map(|i| start + i as f32).collect();
        buffer.write_channel(0, 0, &left);
        if buffer.channel_count() == 2 {
            let right: Vec<f32> = left.iter().map(|s| -s).collect();
            buffer.write_channel(1, 0, &right);
        }
        buffer.zero_from(valid);
        buffer.publish(index as u64, valid, is_final);
    }

    fn callback(shared: &Arc<SessionShared>) -> (RenderCallback, rtrb::Consumer<RenderEvent>) {
        let (producer, consumer) = rtrb::RingBuffer::new(4);
        (RenderCallback::new(Arc::clone(shared), producer), consumer)
    }

    fn render_mono(callback: &mut RenderCallback, frames: usize) -> (Vec<f32>, RenderOutcome) {
        let mut out = vec![f32::NAN; frames];
        let outcome = callback.render_interleaved(&mut out, 1);
        (out, outcome)
    }

    #[test]
    fn crosses_buffer_boundary_mid_call() {
        let shared = session(3, 4, 1);
        publish_ramp(&shared, 0, 0.0, 4, false);
        publish_ramp(&shared, 1, 4.0, 4, false);
        shared.set_playing(true);
        let (mut callback, _events) = callback(&shared);

        let (out, outcome) = render_mono(&mut callback, 6);
        assert_eq!(outcome, RenderOutcome::Rendered);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(shared.pool().buffer_at(0).state(), BufferState::Stale);
        assert_eq!(shared.pool().buffer_at(1).state(), BufferState::Reading);
        assert!(shared.cursor().refill_requested());
        assert_eq!(shared.cursor().current_buffer(), 1);
        assert_eq!(shared.cursor().read_offset(), 2);
        assert_eq!(shared.position().frames_buffered_samples(), 6);
    }

    #[test]
    fn underrun_outputs_silence_and_resumes() {
        let shared = session(2, 4, 1);
        publish_ramp(&shared, 0, 0.0, 4, false);
        shared.set_playing(true);
        let (mut callback, mut events) = callback(&shared);

        let (out, outcome) = render_mono(&mut callback, 6);
        assert_eq!(outcome, RenderOutcome::Underrun { silent_frames: 2 });
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 0.0, 0.0]);
        assert_eq!(shared.underrun_count(), 1);
        assert_eq!(events.pop(), Ok(RenderEvent::Underrun { frames: 2 }));
        assert_eq!(shared.position().frames_buffered_samples(), 4);

        publish_ramp(&shared, 1, 4.0, 4, false);
        let (out, outcome) = render_mono(&mut callback, 3);
        assert_eq!(outcome, RenderOutcome::Rendered);
        assert_eq!(out, vec![4.0, 5.0, 6.0], "No sample skipped after underrun");
    }

    #[test]
    fn final_buffer_ends_after_last_real_frame() {
        let shared = session(2, 4, 1);
        publish_ramp(&shared, 0, 0.0, 4, false);
        publish_ramp(&shared, 1, 4.0, 3, true);
        shared.set_playing(true);
        let (mut callback, mut events) = callback(&shared);

        let (out, outcome) = render_mono(&mut callback, 10);
        assert_eq!(outcome, RenderOutcome::Ended);
        assert_eq!(
            out,
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 0.0]
        );
        assert!(shared.has_ended());
        assert_eq!(events.pop(), Ok(RenderEvent::Ended));
        assert_eq!(shared.position().frames_buffered_samples(), 7);

        let (out, outcome) = render_mono(&mut callback, 2);
        assert_eq!(outcome, RenderOutcome::Silent);
        assert_eq!(out, vec![0.0, 0.0]);
        assert!(events.pop().is_err(), "End of stream is reported once");
    }

    #[test]
    fn paused_and_seeking_render_silence() {
        let shared = session(2, 4, 1);
        publish_ramp(&shared, 0, 1.0, 4, false);
        let (mut callback, _events) = callback(&shared);

        let (out, outcome) = render_mono(&mut callback, 2);
        assert_eq!(outcome, RenderOutcome::Silent);
        assert_eq!(out, vec![0.0, 0.0]);

        shared.set_playing(true);
        shared.seeking.store(true, Ordering::SeqCst);
        let (_, outcome) = render_mono(&mut callback, 2);
        assert_eq!(outcome, RenderOutcome::Silent);
        assert!(!shared.render_active.load(Ordering::SeqCst));
        assert_eq!(shared.pool().buffer_at(0).state(), BufferState::Filled);
    }

    #[test]
    fn stereo_maps_to_wide_outputs() {
        let shared = session(2, 4, 2);
        publish_ramp(&shared, 0, 1.0, 4, false);
        shared.set_playing(true);
        let (mut callback, _events) = callback(&shared);

        let mut out = vec![f32::NAN; 8];
        callback.render_interleaved(&mut out, 4);
        assert_eq!(out, vec![1.0, -1.0, 0.0, 0.0, 2.0, -2.0, 0.0, 0.0]);

        let mut mono = vec![f32::NAN; 1];
        callback.render_interleaved(&mut mono, 1);
        assert_eq!(mono, vec![0.0], "Stereo downmix to one channel");
    }

    #[test]
    fn mono_duplicates_to_every_channel() {
        let shared = session(2, 4, 1);
        publish_ramp(&shared, 0, 1.0, 4, false);
        shared.set_playing(true);
        let (mut callback, _events) = callback(&shared);

        let mut out = vec![f32::NAN; 6];
        callback.render_interleaved(&mut out, 2);
        assert_eq!(out, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
    }
}
