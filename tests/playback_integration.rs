//! End-to-end playback through the stub backend, with the test thread acting
//! as the audio hardware.

use std::sync::Arc;
use std::time::Duration;

use pcm_streamer::audio::{MemoryFrameSource, RenderOutcome};
use pcm_streamer::engine::DesktopStubBackend;
use pcm_streamer::testing::{ramp_source, render_until_end, wait_until, SlowSource};
use pcm_streamer::{MediaTime, PlaybackEngine, PlaybackEvent, PlaybackState, PlayerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LIMIT: Duration = Duration::from_secs(10);

fn config(buffers: usize, frames_per_buffer: usize, slice: usize) -> PlayerConfig {
    let mut config = PlayerConfig::default();
    config.playback.buffer_count = buffers;
    config.playback.frames_per_buffer = frames_per_buffer;
    config.playback.render_slice_frames = slice;
    config.playback.fill_chunk_frames = slice;
    config.playback.cycle_interval_ms = 1;
    config
}

fn engine_with(config: PlayerConfig) -> (PlaybackEngine, Arc<DesktopStubBackend>) {
    let backend = Arc::new(DesktopStubBackend::new());
    let engine = PlaybackEngine::with_backend(config, backend.clone()).unwrap();
    (engine, backend)
}

fn ramp_values(frames: usize) -> Vec<f32> {
    (0..frames).map(|i| i as f32).collect()
}

#[test]
fn reconstructs_stream_for_random_geometries() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..12 {
        let slice = [16, 32, 64][rng.gen_range(0..3)];
        let frames_per_buffer = slice * rng.gen_range(1..8);
        let buffers = rng.gen_range(2..6);
        let length = rng.gen_range(1..3000);
        let channels = rng.gen_range(1..=2);
        let pump = rng.gen_range(1..200);

        let (engine, backend) = engine_with(config(buffers, frames_per_buffer, slice));
        engine
            .load_source(Box::new(ramp_source(8000, length, channels).unwrap()))
            .unwrap();
        engine.play().unwrap();

        let capture = render_until_end(&engine, &backend, pump, LIMIT).unwrap();
        let geometry = format!(
            "{} x {} frames, {} ch, length {}, pump {}",
            buffers, frames_per_buffer, channels, length, pump
        );
        assert!(capture.ended, "{}", geometry);
        assert_eq!(capture.left, ramp_values(length), "{}", geometry);
        if channels == 2 {
            let negated: Vec<f32> = ramp_values(length).iter().map(|v| -v).collect();
            assert_eq!(capture.right, negated, "{}", geometry);
        }
        assert_eq!(engine.frames_buffered(), engine.file_duration(), "{}", geometry);
    }
}

#[test]
fn five_thousand_frame_file_reports_exact_duration() {
    let (engine, backend) = engine_with(config(3, 1024, 256));
    engine
        .load_source(Box::new(ramp_source(44100, 5000, 1).unwrap()))
        .unwrap();
    engine.play().unwrap();

    let capture = render_until_end(&engine, &backend, 256, LIMIT).unwrap();

    assert!(capture.ended);
    assert_eq!(capture.left.len(), 5000);
    assert_eq!(engine.frames_buffered(), MediaTime::from_frames(5000, 44100));
    assert_eq!(engine.frames_buffered(), engine.file_duration());
}

#[test]
fn underrun_renders_silence_then_resumes() {
    let (engine, backend) = engine_with(config(2, 64, 64));
    let (source, throttle) = SlowSource::new(
        ramp_source(8000, 2000, 1).unwrap(),
        Duration::from_millis(200),
    );
    engine.load_source(Box::new(source)).unwrap();
    engine.play().unwrap();

    // Buffer 0 is primed synchronously; the slow cycler cannot keep up.
    let first = backend.render(64).unwrap();
    assert_eq!(first.left, ramp_values(64));
    let starved = backend.render(64).unwrap();
    assert_eq!(starved.outcome, RenderOutcome::Underrun { silent_frames: 64 });
    assert!(starved.left.iter().all(|&sample| sample == 0.0));
    assert!(engine.underrun_count() >= 1);
    assert_eq!(engine.frames_buffered().value, 64);

    throttle.set_delay(Duration::ZERO);
    let capture = render_until_end(&engine, &backend, 64, LIMIT).unwrap();
    assert!(capture.ended);
    assert_eq!(capture.left, (64..2000).map(|i| i as f32).collect::<Vec<_>>());
}

#[test]
fn end_of_stream_fires_once_and_goes_idle() {
    let (engine, backend) = engine_with(config(3, 128, 64));
    let mut rx = engine.subscribe();
    engine
        .load_source(Box::new(ramp_source(8000, 700, 1).unwrap()))
        .unwrap();
    engine.play().unwrap();

    let capture = render_until_end(&engine, &backend, 64, LIMIT).unwrap();
    assert!(capture.ended);
    assert!(wait_until(LIMIT, || engine.state() == PlaybackState::Idle));

    // Further render calls after the end stay silent and emit nothing new.
    assert_eq!(backend.render(64).unwrap().outcome, RenderOutcome::Silent);

    let events: Vec<PlaybackEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    let ended = events
        .iter()
        .filter(|event| **event == PlaybackEvent::PlaybackEnded)
        .count();
    assert_eq!(ended, 1);
    assert!(matches!(events[0], PlaybackEvent::StateChanged { .. }));
}

#[test]
fn plays_wav_file_from_disk() {
    let path = std::env::temp_dir().join(format!("pcm-streamer-play-{}.wav", std::process::id()));
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 22050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..1500i32 {
        writer.write_sample((i * 10) as i16).unwrap();
        writer.write_sample((-i * 10) as i16).unwrap();
    }
    writer.finalize().unwrap();

    let (engine, backend) = engine_with(config(3, 256, 64));
    let descriptor = engine.load_file(&path).unwrap();
    assert_eq!(descriptor.channel_count, 2);
    assert_eq!(descriptor.total_frames, 1500);
    assert_eq!(engine.file_duration(), MediaTime::from_frames(1500, 22050));

    engine.play().unwrap();
    let capture = render_until_end(&engine, &backend, 100, LIMIT).unwrap();
    std::fs::remove_file(&path).ok();

    assert!(capture.ended);
    assert_eq!(capture.left.len(), 1500);
    let scale = f32::from(i16::MAX);
    assert!((capture.left[1000] - 10000.0 / scale).abs() < 1e-6);
    assert!((capture.right[1000] + 10000.0 / scale).abs() < 1e-6);
}

#[test]
fn frame_count_quirk_is_corrected_when_configured() {
    let mut corrected = config(3, 128, 64);
    corrected.playback.frame_count_correction = 64;
    let (engine, backend) = engine_with(corrected);

    let source = MemoryFrameSource::new(8000, vec![ramp_values(500)])
        .unwrap()
        .with_frame_count_quirk(64);
    let descriptor = engine.load_source(Box::new(source)).unwrap();
    assert!(descriptor.frame_count_quirk);
    assert_eq!(descriptor.total_frames, 564);
    assert_eq!(engine.file_duration(), MediaTime::from_frames(500, 8000));

    engine.play().unwrap();
    let capture = render_until_end(&engine, &backend, 64, LIMIT).unwrap();
    assert_eq!(capture.left, ramp_values(500));
    assert_eq!(engine.frames_buffered(), engine.file_duration());
}
