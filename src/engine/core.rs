//! PlaybackEngine: control-thread facade over the streaming core.
//!
//! Owns the loaded source, the buffer pool and at most one playback session.
//! A session is created by `play()` from a stopped engine and torn down by
//! `stop()`, a new load, or drop. While it runs, the session's state is shared
//! between three contexts: the output backend's real-time thread (through the
//! `RenderCallback`), the cycler thread, and whichever thread calls into this
//! type.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::audio::buffer_pool::{BufferPool, PoolStatus};
use crate::audio::callback::RenderCallback;
use crate::audio::cycler::{CyclerHandle, RingBufferCycler};
use crate::audio::position::PositionTracker;
use crate::audio::seek::{SeekController, SeekOutcome, SeekPhase};
use crate::audio::session::SessionShared;
use crate::audio::source::{FrameSource, StreamDescriptor, TrackMetadata};
use crate::audio::time::MediaTime;
use crate::audio::wav_source::WavFrameSource;
use crate::config::PlayerConfig;
#[cfg(not(target_os = "android"))]
use crate::engine::backend::CpalBackend;
#[cfg(target_os = "android")]
use crate::engine::backend::OboeBackend;
use crate::engine::backend::{OutputBackend, OutputFormat};
use crate::error::{log_audio_error, AudioError};
use crate::telemetry::{EventHub, PlaybackEvent, PlaybackObserver, PlaybackState};

/// Events kept for `EventHub::snapshot`
const EVENT_HISTORY: usize = 32;

struct LoadedFile {
    /// `None` while a session owns the source
    source: Option<Box<dyn FrameSource>>,
    descriptor: StreamDescriptor,
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    cycler: CyclerHandle,
}

#[derive(Default)]
struct EngineInner {
    loaded: Option<LoadedFile>,
    session: Option<ActiveSession>,
    pool: Arc<BufferPool>,
    /// Sample position the next session starts at
    pending_start: u64,
    /// Fatal error of a torn-down session, cleared by the next load
    failure: Option<AudioError>,
}

/// Streaming PCM player
pub struct PlaybackEngine {
    config: PlayerConfig,
    backend: Arc<dyn OutputBackend>,
    hub: Arc<EventHub>,
    seek: SeekController,
    inner: Mutex<EngineInner>,
}

impl PlaybackEngine {
    /// Engine on the platform's output backend
    pub fn new(config: PlayerConfig) -> Result<Self, AudioError> {
        let backend = Self::create_backend(&config);
        Self::with_backend(config, backend)
    }

    /// Engine on an explicit backend, e.g. [`DesktopStubBackend`](crate::engine::DesktopStubBackend)
    pub fn with_backend(
        config: PlayerConfig,
        backend: Arc<dyn OutputBackend>,
    ) -> Result<Self, AudioError> {
        config.validate()?;

        let hub = Arc::new(EventHub::new(
            config.output.event_channel_capacity,
            EVENT_HISTORY,
        ));
        let seek = SeekController::new(
            config.playback.seek_cancel_timeout(),
            config.playback.fill_chunk_frames,
        );

        log::info!(
            "[PlaybackEngine] Created with {} backend ({} x {} frames)",
            backend.name(),
            config.playback.buffer_count,
            config.playback.frames_per_buffer
        );

        Ok(Self {
            config,
            backend,
            hub,
            seek,
            inner: Mutex::new(EngineInner::default()),
        })
    }

    #[cfg(target_os = "android")]
    fn create_backend(_config: &PlayerConfig) -> Arc<dyn OutputBackend> {
        Arc::new(OboeBackend::new())
    }

    #[cfg(not(target_os = "android"))]
    fn create_backend(config: &PlayerConfig) -> Arc<dyn OutputBackend> {
        Arc::new(CpalBackend::new(config.output.match_file_sample_rate))
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, EngineInner>, AudioError> {
        self.inner.lock().map_err(|_| AudioError::LockPoisoned {
            component: "playback_engine".to_string(),
        })
    }

    // ========================================================================
    // LOADING
    // ========================================================================

    /// Open a WAV file and make it the current source
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<StreamDescriptor, AudioError> {
        let source = WavFrameSource::open(path)?;
        self.load_source(Box::new(source))
    }

    /// Make `source` the current source, replacing any previous load
    ///
    /// Stops a running session. The buffer pool is reallocated only when the
    /// ring geometry or channel count changes.
    ///
    /// # Errors
    /// - `UnsupportedFormat` for a zero sample rate or more than two channels
    /// - `AllocationFailed` if the pool cannot be sized
    pub fn load_source(
        &self,
        source: Box<dyn FrameSource>,
    ) -> Result<StreamDescriptor, AudioError> {
        let loaded = {
            let mut inner = self.lock_inner()?;
            self.teardown(&mut inner);
            if let Some(mut previous) = inner.loaded.take().and_then(|file| file.source) {
                previous.close();
            }
            inner.failure = None;
            inner.pending_start = 0;
            self.install(&mut inner, source)
        };

        match loaded {
            Ok((descriptor, metadata)) => {
                let duration = self.tracker_for(&descriptor).file_duration();
                log::info!(
                    "[PlaybackEngine] Loaded {:?}: {} Hz, {} ch, {:.3}s",
                    metadata.title,
                    descriptor.sample_rate,
                    descriptor.channel_count,
                    duration.seconds()
                );
                self.hub.set_state(PlaybackState::Idle);
                self.hub.duration_known(duration);
                self.hub.metadata_available(metadata);
                Ok(descriptor)
            }
            Err(err) => {
                log_audio_error(&err, "load_source");
                self.hub.set_state(PlaybackState::Empty);
                Err(err)
            }
        }
    }

    fn install(
        &self,
        inner: &mut EngineInner,
        mut source: Box<dyn FrameSource>,
    ) -> Result<(StreamDescriptor, TrackMetadata), AudioError> {
        let descriptor = source.descriptor().clone();
        if descriptor.sample_rate == 0 || !(1..=2).contains(&descriptor.channel_count) {
            source.close();
            return Err(AudioError::UnsupportedFormat {
                reason: format!(
                    "{} Hz with {} channels",
                    descriptor.sample_rate, descriptor.channel_count
                ),
            });
        }

        let playback = &self.config.playback;
        let channels = usize::from(descriptor.channel_count);
        match Arc::get_mut(&mut inner.pool) {
            Some(pool) => {
                pool.allocate(playback.buffer_count, playback.frames_per_buffer, channels)?;
            }
            None => {
                // A stale render callback still holds the old ring.
                inner.pool = Arc::new(BufferPool::new(
                    playback.buffer_count,
                    playback.frames_per_buffer,
                    channels,
                )?);
            }
        }

        let metadata = source.metadata();
        inner.loaded = Some(LoadedFile {
            source: Some(source),
            descriptor: descriptor.clone(),
        });
        Ok((descriptor, metadata))
    }

    fn tracker_for(&self, descriptor: &StreamDescriptor) -> PositionTracker {
        PositionTracker::for_descriptor(descriptor, self.config.playback.frame_count_correction)
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    /// Start or resume playback
    ///
    /// From a stopped engine this primes buffer 0 at the pending start
    /// position, spawns the cycler and starts the output stream. After the
    /// stream has ended, playback restarts from the beginning.
    ///
    /// # Errors
    /// - `NoFileLoaded` if nothing is loaded
    /// - the session's fatal error until the next load
    pub fn play(&self) -> Result<(), AudioError> {
        let mut inner = self.lock_inner()?;
        if let Some(err) = inner.failure.clone() {
            return Err(err);
        }

        if let Some(session) = inner.session.as_ref() {
            let shared = Arc::clone(&session.shared);
            if let Some(err) = shared.failure() {
                return Err(err);
            }
            if shared.has_ended() {
                self.seek.seek_to_sample(&shared, 0)?;
            }
            shared.set_playing(true);
            drop(inner);
            self.hub.set_live_state(PlaybackState::Playing);
            return Ok(());
        }

        let start_at = inner.pending_start;
        let (source, descriptor) = {
            let loaded = inner.loaded.as_mut().ok_or(AudioError::NoFileLoaded)?;
            let source = loaded.source.take().ok_or(AudioError::NoFileLoaded)?;
            (source, loaded.descriptor.clone())
        };

        let format = OutputFormat {
            sample_rate: descriptor.sample_rate,
            channels: descriptor.channel_count,
        };
        let shared = Arc::new(SessionShared::new(
            Arc::clone(&inner.pool),
            self.tracker_for(&descriptor),
            source,
        ));

        match self.start_session(&shared, start_at, format) {
            Ok(cycler) => {
                inner.session = Some(ActiveSession { shared, cycler });
            }
            Err(err) => {
                if let Some(loaded) = inner.loaded.as_mut() {
                    loaded.source = shared.take_source();
                }
                log_audio_error(&err, "play");
                return Err(err);
            }
        }
        drop(inner);

        log::info!("[PlaybackEngine] Playback started at sample {}", start_at);
        Ok(())
    }

    fn start_session(
        &self,
        shared: &Arc<SessionShared>,
        start_at: u64,
        format: OutputFormat,
    ) -> Result<CyclerHandle, AudioError> {
        self.seek.prime(shared, start_at)?;

        // Announced before the cycler exists so a fill failure lands after it.
        self.hub.set_live_state(PlaybackState::Playing);

        let playback = &self.config.playback;
        let (producer, consumer) = rtrb::RingBuffer::new(playback.event_queue_capacity);
        let cycler = RingBufferCycler::new(
            Arc::clone(shared),
            Arc::clone(&self.hub),
            consumer,
            playback.fill_chunk_frames,
            playback.cycle_interval(),
        )
        .spawn()
        .inspect_err(|_| {
            self.hub.set_live_state(PlaybackState::Idle);
        })?;

        shared.set_playing(true);
        let callback = RenderCallback::new(Arc::clone(shared), producer);
        if let Err(err) = self.backend.start(callback, format) {
            shared.set_playing(false);
            cycler.shutdown();
            self.hub.set_live_state(PlaybackState::Idle);
            return Err(err);
        }
        Ok(cycler)
    }

    /// Silence output, keeping the session and its position
    pub fn pause(&self) -> Result<(), AudioError> {
        let inner = self.lock_inner()?;
        if inner.loaded.is_none() {
            return Err(AudioError::NoFileLoaded);
        }
        let Some(session) = inner.session.as_ref() else {
            return Ok(());
        };
        if !session.shared.is_playing() {
            return Ok(());
        }
        session.shared.set_playing(false);
        drop(inner);

        self.hub.set_live_state(PlaybackState::Paused);
        Ok(())
    }

    /// End the session and rewind; the next `play()` starts from the beginning
    pub fn stop(&self) -> Result<(), AudioError> {
        let mut inner = self.lock_inner()?;
        if inner.loaded.is_none() {
            return Err(AudioError::NoFileLoaded);
        }
        self.teardown(&mut inner);
        inner.pending_start = 0;
        let failed = inner.failure.is_some();
        drop(inner);

        if !failed {
            self.hub.set_state(PlaybackState::Idle);
        }
        Ok(())
    }

    /// Stop output and the cycler, and hand the source back to the load
    fn teardown(&self, inner: &mut EngineInner) {
        let Some(session) = inner.session.take() else {
            return;
        };
        session.shared.set_playing(false);

        if let Err(err) = self.backend.stop() {
            log::warn!("[PlaybackEngine] Backend stop failed: {}", err);
        }
        session.cycler.shutdown();

        if let Some(err) = session.shared.failure() {
            inner.failure = Some(err);
        }
        match (session.shared.take_source(), inner.loaded.as_mut()) {
            (Some(source), Some(loaded)) => loaded.source = Some(source),
            (Some(mut source), None) => source.close(),
            (None, _) => {}
        }
        log::info!("[PlaybackEngine] Session torn down");
    }

    /// Jump to `seconds`
    ///
    /// The target is floored to a whole sample and clamped to the playable
    /// range. With no session running the position is stored for the next
    /// `play()`. While another seek is in flight the request is handed to it
    /// and `Coalesced` is returned.
    ///
    /// # Errors
    /// - `NoFileLoaded` if nothing is loaded
    /// - `CyclerUnresponsive`, `SeekFailed`, `DecodeFailed` from the seek;
    ///   fatal ones fail the session
    pub fn seek(&self, seconds: f64) -> Result<SeekOutcome, AudioError> {
        let shared = {
            let mut inner = self.lock_inner()?;
            let descriptor = inner
                .loaded
                .as_ref()
                .map(|loaded| loaded.descriptor.clone())
                .ok_or(AudioError::NoFileLoaded)?;
            match inner.session.as_ref() {
                Some(session) => Arc::clone(&session.shared),
                None => {
                    let target = self
                        .tracker_for(&descriptor)
                        .convert_seconds_to_sample_position(seconds);
                    inner.pending_start = target;
                    log::debug!("[PlaybackEngine] Next session starts at sample {}", target);
                    return Ok(SeekOutcome::Completed {
                        sample_position: target,
                    });
                }
            }
        };

        if let Some(err) = shared.failure() {
            return Err(err);
        }

        let target = shared.position().convert_seconds_to_sample_position(seconds);
        match self.seek.seek_to_sample(&shared, target) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                log_audio_error(&err, "seek");
                if err.is_fatal() {
                    shared.record_failure(err.clone());
                    self.hub.fail(&err);
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    fn with_session<T>(&self, f: impl FnOnce(&SessionShared) -> T) -> Option<T> {
        let inner = self.lock_inner().ok()?;
        inner.session.as_ref().map(|session| f(session.shared.as_ref()))
    }

    pub fn is_playing(&self) -> bool {
        self.with_session(|shared| shared.is_playing() && !shared.has_ended())
            .unwrap_or(false)
    }

    /// Position of the next frame to be rendered
    ///
    /// Without a session this is the pending start position.
    pub fn frames_buffered(&self) -> MediaTime {
        let Ok(inner) = self.lock_inner() else {
            return MediaTime::zero(1);
        };
        match (inner.session.as_ref(), inner.loaded.as_ref()) {
            (Some(session), _) => session.shared.position().frames_buffered(),
            (None, Some(loaded)) => {
                MediaTime::from_frames(inner.pending_start, loaded.descriptor.sample_rate)
            }
            (None, None) => MediaTime::zero(1),
        }
    }

    /// Playable duration, corrected for the frame-count quirk
    pub fn file_duration(&self) -> MediaTime {
        self.descriptor()
            .map(|descriptor| self.tracker_for(&descriptor).file_duration())
            .unwrap_or(MediaTime::zero(1))
    }

    pub fn file_duration_in_seconds(&self) -> f64 {
        self.file_duration().seconds()
    }

    pub fn state(&self) -> PlaybackState {
        self.hub.state()
    }

    /// Underruns in the current session
    pub fn underrun_count(&self) -> u64 {
        self.with_session(|shared| shared.underrun_count())
            .unwrap_or(0)
    }

    pub fn pool_status(&self) -> PoolStatus {
        match self.lock_inner() {
            Ok(inner) => inner.pool.status(),
            Err(_) => PoolStatus::default(),
        }
    }

    /// Fatal error of the current or last session since the last load
    pub fn last_error(&self) -> Option<AudioError> {
        let inner = self.lock_inner().ok()?;
        inner.failure.clone().or_else(|| {
            inner
                .session
                .as_ref()
                .and_then(|session| session.shared.failure())
        })
    }

    pub fn descriptor(&self) -> Option<StreamDescriptor> {
        let inner = self.lock_inner().ok()?;
        inner.loaded.as_ref().map(|loaded| loaded.descriptor.clone())
    }

    pub fn seek_phase(&self) -> SeekPhase {
        self.seek.phase()
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.hub.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn PlaybackObserver>) {
        self.hub.add_observer(observer);
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut inner = std::mem::take(inner);
        self.teardown(&mut inner);
        if let Some(mut source) = inner.loaded.take().and_then(|file| file.source) {
            source.close();
        }
    }
}
