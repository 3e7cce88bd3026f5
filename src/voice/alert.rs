//! Local alert played on the companion device

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};

use crate::{Error, Result};

/// Extra time allowed past the pattern length before giving up on playback
const PLAYBACK_GRACE: Duration = Duration::from_millis(500);

/// Peak amplitude of the generated tone
const TONE_AMPLITUDE: f32 = 0.4;

/// Fade applied to each tone edge to avoid clicks
const FADE: Duration = Duration::from_millis(5);

/// Something that happens when a `RING` arrives
#[async_trait]
pub trait AlertAction: Send + Sync {
    /// Produce the alert, resolving once it has finished
    ///
    /// # Errors
    ///
    /// Returns error if the alert could not be produced
    async fn alert(&self) -> Result<()>;
}

/// Shape of the beep pattern
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSettings {
    /// Tone pitch
    pub frequency_hz: f32,

    /// Length of each beep; gaps are the same length
    pub tone: Duration,

    /// Number of beeps
    pub repeats: u32,
}

impl Default for ToneSettings {
    fn default() -> Self {
        Self {
            frequency_hz: 880.0,
            tone: Duration::from_millis(250),
            repeats: 4,
        }
    }
}

/// Plays a beep pattern on the default output device
pub struct ToneAlert {
    settings: ToneSettings,
}

impl ToneAlert {
    /// Create a tone alert
    #[must_use]
    pub const fn new(settings: ToneSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl AlertAction for ToneAlert {
    async fn alert(&self) -> Result<()> {
        let settings = self.settings;
        tokio::task::spawn_blocking(move || play_blocking(settings))
            .await
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

/// Logs instead of making noise, for headless companions
#[derive(Debug, Default)]
pub struct LogAlert;

#[async_trait]
impl AlertAction for LogAlert {
    async fn alert(&self) -> Result<()> {
        tracing::info!("RING");
        Ok(())
    }
}

fn play_blocking(settings: ToneSettings) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(Error::Audio(format!(
            "unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }

    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels);
    let sample_rate = config.sample_rate.0;
    let samples = beep_pattern(sample_rate, settings);
    let sample_count = samples.len();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "alert playback initialized"
    );

    let (done_tx, done_rx) = std_mpsc::sync_channel::<()>(1);
    let mut done_tx = Some(done_tx);
    let mut position = 0usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    position = position.saturating_add(1);
                }
                if position >= samples.len() {
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.try_send(());
                    }
                }
            },
            |err: cpal::StreamError| tracing::error!(error = %err, "alert playback error"),
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let timeout = duration_of_frames(sample_count, sample_rate) + PLAYBACK_GRACE;
    if done_rx.recv_timeout(timeout).is_err() {
        tracing::warn!("alert playback did not finish in time");
    }

    // Let the device drain its last period
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    tracing::debug!(samples = sample_count, "alert playback complete");
    Ok(())
}

/// Mono beep pattern: `repeats` × (tone, equal-length gap)
#[allow(clippy::cast_precision_loss)]
pub(crate) fn beep_pattern(sample_rate: u32, settings: ToneSettings) -> Vec<f32> {
    let tone_len = frames_in(settings.tone, sample_rate);
    let fade_len = frames_in(FADE, sample_rate).min(tone_len / 2).max(1);
    let rate = sample_rate as f32;

    let mut out = Vec::with_capacity(tone_len * 2 * settings.repeats as usize);
    for _ in 0..settings.repeats {
        for i in 0..tone_len {
            let edge = i.min(tone_len - 1 - i);
            let envelope = (edge as f32 / fade_len as f32).min(1.0);
            let t = i as f32 / rate;
            out.push(
                TONE_AMPLITUDE
                    * envelope
                    * (2.0 * std::f32::consts::PI * settings.frequency_hz * t).sin(),
            );
        }
        out.resize(out.len() + tone_len, 0.0);
    }
    out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn frames_in(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)) as usize
}

#[allow(clippy::cast_precision_loss)]
fn duration_of_frames(frames: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / f64::from(sample_rate))
}
