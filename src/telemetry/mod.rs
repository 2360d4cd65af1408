//! Playback notifications: observer fan-out plus an async broadcast stream.
//!
//! The hub is fed from the control thread and the cycler thread. The render
//! callback never publishes here; it forwards events to the cycler instead.
//!
//! Broadcast subscribers and the event history are updated inline. Observer
//! hooks are queued to a dedicated `pcm-notifier` thread, so a hook may call
//! back into the engine (seek, stop, play) without stalling the cycler or the
//! caller that produced the event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use crate::audio::source::TrackMetadata;
use crate::audio::time::MediaTime;
use crate::error::{AudioError, ErrorCode};

pub mod events;

pub use events::{PlaybackEvent, PlaybackState};

/// Consumer of playback notifications
///
/// Every hook is optional. Hooks run one at a time, in publish order, on the
/// hub's notifier thread; never on the real-time thread, the cycler thread or
/// the thread that triggered the event. They may call back into the engine.
pub trait PlaybackObserver: Send + Sync {
    fn state_changed(&self, _state: PlaybackState) {}

    fn duration_known(&self, _duration: MediaTime) {}

    fn playback_ended(&self) {}

    fn metadata_available(&self, _metadata: &TrackMetadata) {}
}

/// Snapshot of hub state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventSnapshot {
    pub state: PlaybackState,
    pub recent: Vec<PlaybackEvent>,
    pub total_events: u64,
}

/// Observers plus the dispatch counter, shared with the notifier thread
#[derive(Default)]
struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn PlaybackObserver>>>,
    dispatched: AtomicU64,
}

impl ObserverRegistry {
    fn snapshot(&self) -> Vec<Arc<dyn PlaybackObserver>> {
        // Hooks run outside the lock so an observer may register another.
        match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn dispatch(&self, event: &PlaybackEvent) {
        for observer in &self.snapshot() {
            match event {
                PlaybackEvent::StateChanged { state } => observer.state_changed(*state),
                PlaybackEvent::DurationKnown { duration } => observer.duration_known(*duration),
                PlaybackEvent::MetadataAvailable { metadata } => {
                    observer.metadata_available(metadata)
                }
                PlaybackEvent::PlaybackEnded => observer.playback_ended(),
                PlaybackEvent::Underrun { .. } | PlaybackEvent::Error { .. } => {}
            }
        }
        self.dispatched.fetch_add(1, Ordering::Release);
    }

    fn run(&self, mut rx: mpsc::UnboundedReceiver<PlaybackEvent>) {
        log::debug!("[EventHub] Notifier started");
        while let Some(event) = rx.blocking_recv() {
            self.dispatch(&event);
        }
        log::debug!("[EventHub] Notifier stopped");
    }
}

/// Observer registry, broadcast sender and bounded event history.
pub struct EventHub {
    tx: broadcast::Sender<PlaybackEvent>,
    /// `None` only if the notifier thread could not be spawned
    notifier: Option<mpsc::UnboundedSender<PlaybackEvent>>,
    registry: Arc<ObserverRegistry>,
    queued: AtomicU64,
    state: AtomicU8,
    history: Mutex<VecDeque<PlaybackEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
}

impl EventHub {
    pub fn new(channel_capacity: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity.max(1));
        let registry = Arc::new(ObserverRegistry::default());
        let notifier = Self::spawn_notifier(&registry);
        Self {
            tx,
            notifier,
            registry,
            queued: AtomicU64::new(0),
            state: AtomicU8::new(PlaybackState::Empty as u8),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_events: AtomicU64::new(0),
        }
    }

    /// Start the thread that runs observer hooks
    ///
    /// It exits once the hub, and with it the last sender, is dropped.
    fn spawn_notifier(
        registry: &Arc<ObserverRegistry>,
    ) -> Option<mpsc::UnboundedSender<PlaybackEvent>> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let worker = Arc::clone(registry);
        match thread::Builder::new()
            .name("pcm-notifier".to_string())
            .spawn(move || worker.run(notify_rx))
        {
            Ok(_) => Some(notify_tx),
            Err(err) => {
                log::error!(
                    "[EventHub] Failed to spawn notifier thread: {}. Observers run inline.",
                    err
                );
                None
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn PlaybackObserver>) {
        match self.registry.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    pub fn observer_count(&self) -> usize {
        match self.registry.observers.read() {
            Ok(observers) => observers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Wait until every hook queued so far has returned
    ///
    /// Returns false after `limit`. Calling this from inside a hook always
    /// times out.
    pub fn flush(&self, limit: Duration) -> bool {
        let target = self.queued.load(Ordering::Acquire);
        let deadline = Instant::now() + limit;
        while self.registry.dispatched.load(Ordering::Acquire) < target {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`, notifying only on an actual change
    pub fn set_state(&self, state: PlaybackState) -> bool {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous == state as u8 {
            return false;
        }
        self.announce(previous, state);
        true
    }

    /// Like `set_state`, but a `Failed` hub stays failed
    ///
    /// Used for transport transitions that can race with a cycler failure.
    pub fn set_live_state(&self, state: PlaybackState) -> bool {
        let failed = PlaybackState::Failed as u8;
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != failed && current != state as u8).then_some(state as u8)
            });
        match result {
            Ok(previous) => {
                self.announce(previous, state);
                true
            }
            Err(_) => false,
        }
    }

    fn announce(&self, previous: u8, state: PlaybackState) {
        log::debug!(
            "[EventHub] State {:?} -> {:?}",
            PlaybackState::from_u8(previous),
            state
        );
        self.publish(PlaybackEvent::StateChanged { state });
    }

    pub fn duration_known(&self, duration: MediaTime) {
        self.publish(PlaybackEvent::DurationKnown { duration });
    }

    pub fn metadata_available(&self, metadata: TrackMetadata) {
        self.publish(PlaybackEvent::MetadataAvailable { metadata });
    }

    pub fn playback_ended(&self) {
        self.publish(PlaybackEvent::PlaybackEnded);
    }

    pub fn underrun(&self, frames: usize) {
        self.publish(PlaybackEvent::Underrun { frames });
    }

    /// Publish a fatal error and move to `Failed`
    pub fn fail(&self, err: &AudioError) {
        self.publish(PlaybackEvent::Error {
            code: err.code(),
            message: err.message(),
        });
        self.set_state(PlaybackState::Failed);
    }

    pub fn snapshot(&self) -> EventSnapshot {
        let recent = match self.history.lock() {
            Ok(history) => history.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };
        EventSnapshot {
            state: self.state(),
            recent,
            total_events: self.total_events.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, event: PlaybackEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        if self.history_capacity > 0 {
            let mut history = match self.history.lock() {
                Ok(history) => history,
                Err(poisoned) => poisoned.into_inner(),
            };
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        self.notify(event);
    }

    fn notify(&self, event: PlaybackEvent) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        let event = match &self.notifier {
            Some(notifier) => match notifier.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        self.registry.dispatch(&event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(128, 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::{SampleFormat, StreamDescriptor};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingObserver {
        states: Mutex<Vec<PlaybackState>>,
        ended: AtomicUsize,
    }

    impl PlaybackObserver for CountingObserver {
        fn state_changed(&self, state: PlaybackState) {
            self.states.lock().unwrap().push(state);
        }

        fn playback_ended(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Implements no hooks at all.
    struct SilentObserver;

    impl PlaybackObserver for SilentObserver {}

    fn metadata() -> TrackMetadata {
        TrackMetadata {
            title: Some("clip".to_string()),
            descriptor: StreamDescriptor {
                sample_rate: 44100,
                channel_count: 2,
                sample_format: SampleFormat::Int16,
                bits_per_sample: 16,
                total_frames: 44100,
                frame_count_quirk: false,
            },
        }
    }

    #[test]
    fn hub_without_observers_still_publishes() {
        let hub = EventHub::new(8, 8);
        let mut rx = hub.subscribe();
        hub.playback_ended();
        assert_eq!(rx.try_recv().unwrap(), PlaybackEvent::PlaybackEnded);
    }

    #[test]
    fn state_change_notifies_every_observer_once() {
        let hub = EventHub::new(8, 8);
        let first = Arc::new(CountingObserver::default());
        let second = Arc::new(CountingObserver::default());
        hub.add_observer(first.clone());
        hub.add_observer(second.clone());
        hub.add_observer(Arc::new(SilentObserver));

        assert!(hub.set_state(PlaybackState::Idle));
        assert!(!hub.set_state(PlaybackState::Idle));
        hub.playback_ended();
        assert!(hub.flush(Duration::from_secs(2)));

        assert_eq!(*first.states.lock().unwrap(), vec![PlaybackState::Idle]);
        assert_eq!(*second.states.lock().unwrap(), vec![PlaybackState::Idle]);
        assert_eq!(first.ended.load(Ordering::SeqCst), 1);
        assert_eq!(hub.observer_count(), 3);
    }

    #[derive(Default)]
    struct ThreadRecorder {
        threads: Mutex<Vec<Option<String>>>,
    }

    impl PlaybackObserver for ThreadRecorder {
        fn playback_ended(&self) {
            let name = thread::current().name().map(str::to_string);
            self.threads.lock().unwrap().push(name);
        }
    }

    #[test]
    fn hooks_run_on_notifier_thread() {
        let hub = EventHub::new(8, 8);
        let recorder = Arc::new(ThreadRecorder::default());
        hub.add_observer(recorder.clone());

        hub.playback_ended();
        hub.playback_ended();
        assert!(hub.flush(Duration::from_secs(2)));

        let expected = Some("pcm-notifier".to_string());
        assert_eq!(
            *recorder.threads.lock().unwrap(),
            vec![expected.clone(), expected]
        );
    }

    /// Republishes from inside its own hook.
    struct ChainingObserver {
        hub: std::sync::Weak<EventHub>,
        states: Mutex<Vec<PlaybackState>>,
    }

    impl PlaybackObserver for ChainingObserver {
        fn state_changed(&self, state: PlaybackState) {
            self.states.lock().unwrap().push(state);
        }

        fn playback_ended(&self) {
            if let Some(hub) = self.hub.upgrade() {
                hub.set_state(PlaybackState::Idle);
            }
        }
    }

    #[test]
    fn hook_may_publish_back_into_hub() {
        let hub = Arc::new(EventHub::new(8, 8));
        let observer = Arc::new(ChainingObserver {
            hub: Arc::downgrade(&hub),
            states: Mutex::new(Vec::new()),
        });
        hub.add_observer(observer.clone());

        hub.set_state(PlaybackState::Playing);
        hub.playback_ended();
        assert!(hub.flush(Duration::from_secs(2)));
        // The chained state change is queued behind the hook that made it.
        assert!(hub.flush(Duration::from_secs(2)));

        assert_eq!(
            *observer.states.lock().unwrap(),
            vec![PlaybackState::Playing, PlaybackState::Idle]
        );
        assert_eq!(hub.state(), PlaybackState::Idle);
    }

    #[test]
    fn fail_publishes_error_then_state() {
        let hub = EventHub::new(8, 8);
        let mut rx = hub.subscribe();
        hub.fail(&AudioError::DecodeFailed {
            reason: "bad block".to_string(),
        });

        match rx.try_recv().unwrap() {
            PlaybackEvent::Error { code, message } => {
                assert_eq!(code, crate::error::AudioErrorCodes::DECODE_FAILED);
                assert!(message.contains("bad block"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackEvent::StateChanged {
                state: PlaybackState::Failed
            }
        );
        assert_eq!(hub.state(), PlaybackState::Failed);
    }

    #[test]
    fn live_state_does_not_leave_failed() {
        let hub = EventHub::new(8, 8);
        assert!(hub.set_live_state(PlaybackState::Playing));
        hub.set_state(PlaybackState::Failed);
        assert!(!hub.set_live_state(PlaybackState::Playing));
        assert_eq!(hub.state(), PlaybackState::Failed);
        assert!(hub.set_state(PlaybackState::Idle));
    }

    #[test]
    fn history_is_bounded() {
        let hub = EventHub::new(8, 2);
        hub.underrun(1);
        hub.underrun(2);
        hub.metadata_available(metadata());

        let snapshot = hub.snapshot();
        assert_eq!(snapshot.total_events, 3);
        assert_eq!(snapshot.recent.len(), 2);
        assert_eq!(snapshot.recent[0], PlaybackEvent::Underrun { frames: 2 });
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&PlaybackEvent::Underrun { frames: 512 }).unwrap();
        assert_eq!(json, r#"{"type":"underrun","payload":{"frames":512}}"#);
    }
}
