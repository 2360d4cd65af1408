use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pcm_streamer::audio::{FrameSource, WavFrameSource};
use pcm_streamer::engine::DesktopStubBackend;
use pcm_streamer::testing::render_until_end;
use pcm_streamer::{PlaybackEngine, PlaybackEvent, PlayerConfig};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "pcm_player", about = "Stream a PCM file through the ring-buffered engine")]
struct Cli {
    /// JSON configuration file (defaults to assets/player_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a file to the end, printing playback events as JSON lines
    Play {
        file: PathBuf,
        /// Start position in seconds
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        /// Render into a discarding output on this thread instead of a device
        #[arg(long)]
        null_output: bool,
    },
    /// Print the stream descriptor of a file
    Info { file: PathBuf },
}

#[derive(Serialize)]
struct InfoReport {
    title: Option<String>,
    duration_seconds: f64,
    descriptor: pcm_streamer::StreamDescriptor,
}

fn main() -> ExitCode {
    pcm_streamer::init_logging();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => PlayerConfig::load_from_file(path),
        None => PlayerConfig::load(),
    };

    match cli.command {
        Commands::Play {
            file,
            start,
            null_output,
        } => run_play(config, &file, start, null_output),
        Commands::Info { file } => run_info(&file),
    }
}

fn run_info(file: &Path) -> Result<ExitCode> {
    let source =
        WavFrameSource::open(file).with_context(|| format!("opening {}", file.display()))?;
    let metadata = source.metadata();
    let descriptor = metadata.descriptor;
    let report = InfoReport {
        title: metadata.title,
        duration_seconds: descriptor.reported_duration().seconds(),
        descriptor,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(0))
}

fn run_play(config: PlayerConfig, file: &Path, start: f64, null_output: bool) -> Result<ExitCode> {
    let slice_frames = config.playback.render_slice_frames;
    let null_backend = Arc::new(DesktopStubBackend::new());
    let engine = if null_output {
        PlaybackEngine::with_backend(config, null_backend.clone())
    } else {
        PlaybackEngine::new(config)
    }
    .context("creating playback engine")?;

    let mut events = engine.subscribe();
    engine
        .load_file(file)
        .with_context(|| format!("loading {}", file.display()))?;
    if start > 0.0 {
        engine.seek(start).context("seeking to start position")?;
    }
    engine.play().context("starting playback")?;

    if null_output {
        let limit = Duration::from_secs_f64(engine.file_duration_in_seconds() * 4.0 + 5.0);
        let capture = render_until_end(&engine, &null_backend, slice_frames, limit)?;
        if !capture.ended && engine.last_error().is_none() {
            bail!("playback did not finish within {:?}", limit);
        }
    }

    loop {
        match events.blocking_recv() {
            Ok(event) => {
                println!("{}", serde_json::to_string(&event)?);
                match event {
                    PlaybackEvent::PlaybackEnded => break,
                    PlaybackEvent::Error { code, .. } => {
                        eprintln!("Playback failed with code {code}");
                        return Ok(ExitCode::from(3));
                    }
                    _ => {}
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("[pcm_player] Dropped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    eprintln!(
        "Played {:.3}s with {} underruns",
        engine.file_duration_in_seconds(),
        engine.underrun_count()
    );
    engine.stop()?;
    Ok(ExitCode::from(0))
}
