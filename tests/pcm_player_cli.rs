use std::path::PathBuf;
use std::process::Command;

use serde_json::Value;

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pcm_player"))
}

fn write_wav(name: &str, frames: u32) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{}-{}.wav", name, std::process::id()));
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
    for i in 0..frames {
        writer.write_sample((i % 1000) as i16).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
    path
}

#[test]
fn info_prints_descriptor_json() {
    let path = write_wav("pcm-player-info", 8000);
    let output = cli()
        .arg("info")
        .arg(&path)
        .output()
        .expect("info command");
    std::fs::remove_file(&path).ok();

    assert!(
        output.status.success(),
        "info exited with {:?}",
        output.status.code()
    );
    let report: Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["descriptor"]["sample_rate"], 16000);
    assert_eq!(report["descriptor"]["total_frames"], 8000);
    assert_eq!(report["duration_seconds"], 0.5);
}

#[test]
fn play_with_null_output_runs_to_end() {
    let path = write_wav("pcm-player-play", 12000);
    let output = cli()
        .args(["play", "--null-output", "--start", "0.25"])
        .arg(&path)
        .output()
        .expect("play command");
    std::fs::remove_file(&path).ok();

    assert!(
        output.status.success(),
        "play exited with {:?}",
        output.status.code()
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout utf8");
    assert!(
        stdout.lines().any(|line| line.contains("playback_ended")),
        "expected playback_ended event, got {stdout}"
    );
}

#[test]
fn missing_file_fails() {
    let output = cli()
        .args(["info", "/nonexistent/clip.wav"])
        .output()
        .expect("info command");
    assert_eq!(output.status.code(), Some(1));
}
