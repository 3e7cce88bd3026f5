//! Audio capture from the default input device

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Frames per delivered buffer
pub const BUFFER_FRAMES: usize = 1024;

/// A fixed-size block of mono PCM samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,

    /// Sample rate of the device that produced them
    pub sample_rate: u32,
}

/// A source of fixed-size audio buffers
pub trait AudioSource: Send {
    /// Start delivering buffers on `sink`
    ///
    /// Starting an already running source is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn start(&mut self, sink: mpsc::Sender<AudioBuffer>) -> Result<()>;

    /// Stop delivering buffers and release the device
    ///
    /// Safe to call when already stopped.
    fn stop(&mut self);

    /// Whether the device is currently held
    fn is_capturing(&self) -> bool;
}

struct CaptureWorker {
    stop: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
    sample_rate: u32,
}

/// Captures the default input device at its native sample rate
///
/// The cpal stream lives on a dedicated thread, so the handle itself can move
/// between tasks. Stopping joins that thread, which drops the stream.
#[derive(Default)]
pub struct MicrophoneSource {
    worker: Option<CaptureWorker>,
}

impl MicrophoneSource {
    /// Create a stopped microphone source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample rate of the running capture
    #[must_use]
    pub fn sample_rate(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.sample_rate)
    }
}

impl AudioSource for MicrophoneSource {
    fn start(&mut self, sink: mpsc::Sender<AudioBuffer>) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(sink) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until stop is requested or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match off_runtime(|| ready_rx.recv()) {
            Ok(Ok(sample_rate)) => {
                tracing::debug!(sample_rate, frames = BUFFER_FRAMES, "audio capture started");
                self.worker = Some(CaptureWorker {
                    stop: stop_tx,
                    thread,
                    sample_rate,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = off_runtime(|| thread.join());
                Err(e)
            }
            Err(_) => {
                let _ = off_runtime(|| thread.join());
                Err(Error::Audio("capture thread exited during startup".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
            if off_runtime(|| worker.thread.join()).is_err() {
                tracing::warn!("audio capture thread panicked");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

/// Run a blocking wait without stalling other tasks on a multi-thread runtime
///
/// Device open and teardown happen on the capture thread, but callers sit in
/// async dispatcher loops. Outside a multi-thread runtime `f` runs inline.
fn off_runtime<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(sink: mpsc::Sender<AudioBuffer>) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        ?sample_format,
        "audio capture initialized"
    );

    let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "audio capture error");

    let stream = match sample_format {
        SampleFormat::F32 => {
            let mut chunker = Chunker::new(sink, channels, sample_rate);
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| chunker.push(data),
                on_error,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut chunker = Chunker::new(sink, channels, sample_rate);
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> =
                        data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                    chunker.push(&converted);
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(Error::Audio(format!("unsupported sample format {other:?}")));
        }
    }
    .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok((stream, sample_rate))
}

/// Downmixes interleaved frames and cuts them into fixed-size buffers
pub(crate) struct Chunker {
    sink: mpsc::Sender<AudioBuffer>,
    channels: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl Chunker {
    pub(crate) fn new(sink: mpsc::Sender<AudioBuffer>, channels: usize, sample_rate: u32) -> Self {
        Self {
            sink,
            channels: channels.max(1),
            sample_rate,
            pending: Vec::with_capacity(BUFFER_FRAMES),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn push(&mut self, interleaved: &[f32]) {
        for frame in interleaved.chunks(self.channels) {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            self.pending.push(mono);

            if self.pending.len() == BUFFER_FRAMES {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(BUFFER_FRAMES));
                let buffer = AudioBuffer {
                    samples,
                    sample_rate: self.sample_rate,
                };
                // Never block the audio callback; a slow consumer loses buffers
                if self.sink.try_send(buffer).is_err() {
                    tracing::trace!("audio buffer dropped");
                }
            }
        }
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
