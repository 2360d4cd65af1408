// SeekController - cancel, reposition and re-prime the ring
//
// Phases: Idle -> SeekRequested -> Cancelling -> Reinitializing -> Idle
//
// Requests are latest-wins. Each request records its target and bumps a
// generation counter; one caller at a time drives the state machine. A caller
// that finds a seek already in progress leaves its target behind and returns
// `Coalesced`; the driver re-runs reinitialisation until the generation it
// applied is still the newest.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::audio::cycler::{fill_buffer, FillOutcome, FillScratch};
use crate::audio::session::SessionShared;
use crate::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SeekPhase {
    Idle = 0,
    SeekRequested = 1,
    Cancelling = 2,
    Reinitializing = 3,
}

impl SeekPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SeekPhase::SeekRequested,
            2 => SeekPhase::Cancelling,
            3 => SeekPhase::Reinitializing,
            _ => SeekPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// This call drove the seek; playback resumes at `sample_position`
    Completed { sample_position: u64 },
    /// Another seek was in progress and will apply the newest target
    Coalesced,
}

const POLL_INTERVAL: Duration = Duration::from_micros(250);

pub struct SeekController {
    phase: AtomicU8,
    requested: AtomicU64,
    generation: AtomicU64,
    driving: AtomicBool,
    cancel_timeout: Duration,
    fill_chunk_frames: usize,
}

impl SeekController {
    pub fn new(cancel_timeout: Duration, fill_chunk_frames: usize) -> Self {
        Self {
            phase: AtomicU8::new(SeekPhase::Idle as u8),
            requested: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            driving: AtomicBool::new(false),
            cancel_timeout,
            fill_chunk_frames,
        }
    }

    pub fn phase(&self) -> SeekPhase {
        SeekPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SeekPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Reposition `session` so the next rendered frame is `target`
    ///
    /// Blocks the caller, never the render thread, while the cycler cancels
    /// and buffer 0 is primed.
    ///
    /// # Errors
    /// - `CyclerUnresponsive` if cancellation is not acknowledged in time
    /// - `SeekFailed` / `DecodeFailed` from the source
    pub fn seek_to_sample(
        &self,
        session: &SessionShared,
        target: u64,
    ) -> Result<SeekOutcome, AudioError> {
        self.requested.store(target, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut outcome = SeekOutcome::Coalesced;
        while self
            .driving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let result = self.drive(session);
            self.driving.store(false, Ordering::SeqCst);
            let (sample_position, generation) = result?;
            outcome = SeekOutcome::Completed { sample_position };

            // A request that arrived after the last check saw `driving` set
            // and went home; pick it up.
            if self.generation.load(Ordering::SeqCst) == generation {
                break;
            }
        }

        if outcome == SeekOutcome::Coalesced {
            log::debug!(
                "[SeekController] Seek to sample {} handed to the active seek",
                target
            );
        }
        Ok(outcome)
    }

    /// Fill buffer 0 at `target` for a session no thread is consuming yet
    pub fn prime(&self, session: &SessionShared, target: u64) -> Result<u64, AudioError> {
        self.reinitialize(session, target)
    }

    fn drive(&self, session: &SessionShared) -> Result<(u64, u64), AudioError> {
        self.set_phase(SeekPhase::SeekRequested);

        let result = self.cancel_and_reinitialize(session);

        release(session);
        self.set_phase(SeekPhase::Idle);
        result
    }

    fn cancel_and_reinitialize(&self, session: &SessionShared) -> Result<(u64, u64), AudioError> {
        self.set_phase(SeekPhase::Cancelling);
        self.quiesce(session)?;

        loop {
            let generation = self.generation.load(Ordering::SeqCst);
            let target = self.requested.load(Ordering::SeqCst);

            self.set_phase(SeekPhase::Reinitializing);
            let position = self.reinitialize(session, target)?;

            if self.generation.load(Ordering::SeqCst) == generation {
                log::info!("[SeekController] Resumed at sample {}", position);
                return Ok((position, generation));
            }
            log::debug!(
                "[SeekController] Target {} superseded during reinitialisation",
                target
            );
        }
    }

    /// Hold off the render callback and wait for the cycler to acknowledge
    fn quiesce(&self, session: &SessionShared) -> Result<(), AudioError> {
        session.cancel_acknowledged.store(false, Ordering::SeqCst);
        session.cancel_requested.store(true, Ordering::SeqCst);
        session.seeking.store(true, Ordering::SeqCst);
        session.wake_cycler();

        let started = Instant::now();
        loop {
            let render_idle = !session.render_active.load(Ordering::SeqCst);
            let cycler_idle =
                !session.has_cycler() || session.cancel_acknowledged.load(Ordering::SeqCst);
            if render_idle && cycler_idle {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.cancel_timeout {
                let err = AudioError::CyclerUnresponsive {
                    waited_ms: waited.as_millis() as u64,
                };
                log::error!(
                    "[SeekController] Cancellation not acknowledged (render_idle={}, cycler_idle={})",
                    render_idle,
                    cycler_idle
                );
                return Err(err);
            }

            session.wake_cycler();
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Reposition the source, reset the ring and prime buffer 0 at `target`
    fn reinitialize(&self, session: &SessionShared, target: u64) -> Result<u64, AudioError> {
        let target = target.min(session.position.duration_frames());

        let mut guard = session.lock_source()?;
        let source = guard.as_mut().ok_or(AudioError::NoFileLoaded)?;
        source.seek(session.position.source_offset_for(target))?;

        session.pool.mark_all_stale();
        session.cursor.reset();
        session.final_buffer_reached.store(false, Ordering::Release);
        session.ended.store(false, Ordering::Release);
        session.next_fill.store(0, Ordering::Relaxed);

        let mut scratch = FillScratch::new(self.fill_chunk_frames);
        match fill_buffer(session, source.as_mut(), 0, &mut scratch, false)? {
            FillOutcome::Filled { .. } => {}
            FillOutcome::Busy | FillOutcome::Cancelled => {
                return Err(AudioError::SeekFailed {
                    sample_offset: target,
                    reason: "buffer 0 could not be claimed".to_string(),
                });
            }
        }
        session
            .next_fill
            .store(session.pool.next_index(0), Ordering::Relaxed);
        session.position.set_frames_buffered_at_sample_position(target);

        Ok(target)
    }
}

fn release(session: &SessionShared) {
    session.cancel_requested.store(false, Ordering::SeqCst);
    session.seeking.store(false, Ordering::SeqCst);
    session.wake_cycler();
}
