//! CPAL-based output backend for desktop platforms (Linux, macOS, Windows)
//!
//! `cpal::Stream` is not `Send` on every host, so the stream is built, played
//! and dropped on a dedicated `pcm-output` thread. The control thread only
//! exchanges two messages with it: the start result and the stop request.

use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::callback::RenderCallback;
use crate::error::AudioError;

use super::{OutputBackend, OutputFormat};

struct RunningStream {
    stop_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

/// Output backend driving the host's default output device
pub struct CpalBackend {
    match_file_sample_rate: bool,
    running: Mutex<Option<RunningStream>>,
}

impl CpalBackend {
    pub fn new(match_file_sample_rate: bool) -> Self {
        Self {
            match_file_sample_rate,
            running: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<RunningStream>>, AudioError> {
        self.running.lock().map_err(|_| AudioError::LockPoisoned {
            component: "cpal_backend".to_string(),
        })
    }
}

impl OutputBackend for CpalBackend {
    fn start(&self, callback: RenderCallback, format: OutputFormat) -> Result<(), AudioError> {
        let mut running = self.lock()?;
        if running.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let match_rate = self.match_file_sample_rate;

        let join = thread::Builder::new()
            .name("pcm-output".to_string())
            .spawn(move || {
                let stream = match open_stream(callback, format, match_rate) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if let Err(err) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::HardwareError {
                        details: format!("Failed to start stream: {}", err),
                    }));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Either an explicit stop or the sender being dropped ends the stream.
                let _ = stop_rx.recv();
                if let Err(err) = stream.pause() {
                    log::warn!("[CpalBackend] Failed to pause stream on stop: {}", err);
                }
            })
            .map_err(|err| AudioError::ThreadSpawnFailed {
                name: "pcm-output".to_string(),
                reason: err.to_string(),
            })?;

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(AudioError::StreamOpenFailed {
                reason: "output thread exited before reporting".to_string(),
            })
        });

        match started {
            Ok(()) => {
                log::info!(
                    "[CpalBackend] Output stream started ({} Hz, {} ch)",
                    format.sample_rate,
                    format.channels
                );
                *running = Some(RunningStream { stop_tx, join });
                Ok(())
            }
            Err(err) => {
                let _ = join.join();
                Err(err)
            }
        }
    }

    fn stop(&self) -> Result<(), AudioError> {
        let stream = self.lock()?.take().ok_or(AudioError::NotRunning)?;
        let _ = stream.stop_tx.send(());
        stream.join.join().map_err(|_| AudioError::HardwareError {
            details: "output thread panicked".to_string(),
        })?;
        log::info!("[CpalBackend] Output stream stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lock().map(|running| running.is_some()).unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn open_stream(
    mut callback: RenderCallback,
    format: OutputFormat,
    match_rate: bool,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::StreamOpenFailed {
            reason: "No output device available".to_string(),
        })?;

    let supported = select_config(&device, format, match_rate)?;
    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(AudioError::StreamOpenFailed {
            reason: format!(
                "Unsupported sample format {:?}; only F32 output is supported",
                supported.sample_format()
            ),
        });
    }

    let config: cpal::StreamConfig = supported.into();
    if config.sample_rate.0 != format.sample_rate {
        log::warn!(
            "[CpalBackend] Device runs at {} Hz but the file is {} Hz; playback will be off-pitch",
            config.sample_rate.0,
            format.sample_rate
        );
    }

    let channels = usize::from(config.channels);
    let err_fn = |err| log::error!("[CpalBackend] Output stream error: {}", err);

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback.render_interleaved(data, channels);
            },
            err_fn,
            None,
        )
        .map_err(|err| AudioError::StreamOpenFailed {
            reason: format!("Failed to build output stream: {}", err),
        })
}

/// Prefer an F32 config at the file's rate; fall back to the device default
fn select_config(
    device: &cpal::Device,
    format: OutputFormat,
    match_rate: bool,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    if match_rate {
        let rate = cpal::SampleRate(format.sample_rate);
        let matching = device.supported_output_configs().ok().and_then(|configs| {
            configs
                .filter(|range| {
                    range.sample_format() == cpal::SampleFormat::F32
                        && range.min_sample_rate() <= rate
                        && rate <= range.max_sample_rate()
                })
                .min_by_key(|range| range.channels().abs_diff(format.channels))
        });
        if let Some(range) = matching {
            return Ok(range.with_sample_rate(rate));
        }
        log::warn!(
            "[CpalBackend] No F32 output config at {} Hz, using device default",
            format.sample_rate
        );
    }

    device
        .default_output_config()
        .map_err(|err| AudioError::StreamOpenFailed {
            reason: format!("Failed to get default output config: {}", err),
        })
}
