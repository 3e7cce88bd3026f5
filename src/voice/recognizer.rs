//! Speech recognition
//!
//! The recognizer is an external collaborator: it consumes a stream of audio
//! buffers and produces evolving partial transcripts, then one terminal
//! update (final transcript or failure).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::capture::{AudioBuffer, samples_to_wav};
use crate::{Error, Result};

/// Buffered transcript updates per recognition
const UPDATE_BUFFER: usize = 16;

/// One update from a recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptUpdate {
    /// Best guess so far; later updates supersede it
    Partial(String),

    /// Terminal transcript for the utterance
    Final(String),

    /// Terminal failure
    Failed(String),
}

impl TranscriptUpdate {
    /// Whether the recognizer is done after this update
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Final(_) | Self::Failed(_))
    }
}

/// Converts audio into transcript updates
pub trait SpeechRecognizer: Send + Sync {
    /// Start recognizing `audio`
    ///
    /// Updates arrive on the returned receiver. Recognition ends after a
    /// terminal update, when `audio` closes, or when the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Recognition`] if recognition cannot start
    fn recognize(
        &self,
        audio: mpsc::Receiver<AudioBuffer>,
    ) -> Result<mpsc::Receiver<TranscriptUpdate>>;
}

/// Settings for [`HttpRecognizer`]
#[derive(Debug, Clone)]
pub struct HttpRecognizerSettings {
    /// API base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Bearer token, if the endpoint needs one
    pub api_key: Option<String>,

    /// Transcription model identifier
    pub model: String,

    /// How often the growing utterance is re-transcribed
    pub window: Duration,

    /// Audio length after which the transcript is final
    pub max_utterance: Duration,
}

/// Response from an OpenAI-compatible transcription API
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Recognizer over an OpenAI-compatible `/audio/transcriptions` endpoint
///
/// The endpoint only does batch transcription, so partials are produced by
/// re-sending the whole utterance captured so far every `window`.
pub struct HttpRecognizer {
    client: reqwest::Client,
    settings: HttpRecognizerSettings,
}

impl HttpRecognizer {
    /// Create a new HTTP recognizer
    ///
    /// # Errors
    ///
    /// Returns error if the settings are unusable
    pub fn new(settings: HttpRecognizerSettings) -> Result<Self> {
        if settings.base_url.is_empty() {
            return Err(Error::Config("STT base URL required".to_string()));
        }
        if settings.window.is_zero() {
            return Err(Error::Config("STT window must be non-zero".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            settings,
        })
    }
}

impl SpeechRecognizer for HttpRecognizer {
    fn recognize(
        &self,
        audio: mpsc::Receiver<AudioBuffer>,
    ) -> Result<mpsc::Receiver<TranscriptUpdate>> {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let transcriber = Arc::new(Transcriber {
            client: self.client.clone(),
            settings: self.settings.clone(),
        });

        tokio::spawn(async move {
            let update = match transcriber.run(audio, &tx).await {
                Ok(text) => TranscriptUpdate::Final(text),
                Err(e) => TranscriptUpdate::Failed(e.to_string()),
            };
            let _ = tx.send(update).await;
        });

        Ok(rx)
    }
}

struct Transcriber {
    client: reqwest::Client,
    settings: HttpRecognizerSettings,
}

/// A partial transcription running alongside audio accumulation
type InFlight = JoinHandle<Result<String>>;

impl Transcriber {
    /// Accumulate audio, emitting partials, and return the final transcript
    ///
    /// Audio keeps being drained while a partial request is out, so a slow
    /// endpoint delays partials instead of dropping captured buffers.
    async fn run(
        self: Arc<Self>,
        mut audio: mpsc::Receiver<AudioBuffer>,
        updates: &mpsc::Sender<TranscriptUpdate>,
    ) -> Result<String> {
        let mut samples: Vec<f32> = Vec::new();
        let mut sample_rate = 0;
        let mut requested_len = 0;
        let mut transcribed_len = 0;
        let mut last_text = String::new();
        let mut in_flight: Option<InFlight> = None;

        let mut tick = tokio::time::interval(self.settings.window);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                () = updates.closed() => {
                    if let Some(task) = in_flight.take() {
                        task.abort();
                    }
                    return Ok(last_text);
                }
                buffer = audio.recv() => {
                    let Some(buffer) = buffer else { break };
                    sample_rate = buffer.sample_rate;
                    samples.extend_from_slice(&buffer.samples);

                    if duration_of(samples.len(), sample_rate) >= self.settings.max_utterance {
                        break;
                    }
                }
                Some(joined) = join_partial(&mut in_flight) => {
                    let text = joined?;
                    transcribed_len = requested_len;
                    if !text.trim().is_empty() && text != last_text {
                        last_text.clone_from(&text);
                        if updates.send(TranscriptUpdate::Partial(text)).await.is_err() {
                            return Ok(last_text);
                        }
                    }
                }
                _ = tick.tick(), if in_flight.is_none() => {
                    if samples.len() == requested_len || sample_rate == 0 {
                        continue;
                    }
                    requested_len = samples.len();
                    let transcriber = Arc::clone(&self);
                    let snapshot = samples.clone();
                    in_flight = Some(tokio::spawn(async move {
                        transcriber.transcribe(&snapshot, sample_rate).await
                    }));
                }
            }
        }

        // The final pass covers everything, so a pending partial is moot
        if let Some(task) = in_flight.take() {
            task.abort();
        }

        if samples.len() > transcribed_len && sample_rate > 0 {
            last_text = self.transcribe(&samples, sample_rate).await?;
        }
        Ok(last_text)
    }

    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        let wav = samples_to_wav(samples, sample_rate)?;
        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Recognition(e.to_string()))?,
            )
            .text("model", self.settings.model.clone());

        let url = format!(
            "{}/audio/transcriptions",
            self.settings.base_url.trim_end_matches('/')
        );
        let mut request = self.client.post(&url).multipart(form);
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Recognition(format!("transcription API error {status}: {body}")));
        }

        let body = response.text().await?;
        let result: TranscriptionResponse = serde_json::from_str(&body)?;
        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

/// Wait for the in-flight partial, if there is one
///
/// Resolves to `None` straight away when nothing is running, which disables
/// the branch for that pass of the select loop.
async fn join_partial(task: &mut Option<InFlight>) -> Option<Result<String>> {
    let handle = task.as_mut()?;
    let joined = handle.await;
    *task = None;
    Some(match joined {
        Ok(result) => result,
        Err(e) => Err(Error::Recognition(format!("transcription task failed: {e}"))),
    })
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn duration_of(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Serve `text` as every transcription, answering only after `delay`
    async fn slow_endpoint(delay: Duration, text: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(respond_after(stream, delay, text));
            }
        });

        format!("http://{addr}/v1")
    }

    async fn respond_after(mut stream: TcpStream, delay: Duration, text: &'static str) {
        let mut request = Vec::new();
        let mut chunk = [0u8; 4096];
        while !request_complete(&request) {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&chunk[..n]),
            }
        }

        tokio::time::sleep(delay).await;

        let body = format!(r#"{{"text":"{text}"}}"#);
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok());

        match content_length {
            Some(len) => request.len() >= header_end + 4 + len,
            None => request.ends_with(b"0\r\n\r\n"),
        }
    }

    fn settings() -> HttpRecognizerSettings {
        HttpRecognizerSettings {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            window: Duration::from_millis(500),
            max_utterance: Duration::from_secs(8),
        }
    }

    #[test]
    fn test_duration_of() {
        assert_eq!(duration_of(16_000, 16_000), Duration::from_secs(1));
        assert_eq!(duration_of(100, 0), Duration::ZERO);
    }

    #[test]
    fn test_rejects_zero_window() {
        let mut bad = settings();
        bad.window = Duration::ZERO;
        assert!(HttpRecognizer::new(bad).is_err());
    }

    #[tokio::test]
    async fn test_closed_audio_without_samples_is_empty_final() {
        let recognizer = HttpRecognizer::new(settings()).unwrap();
        let (audio_tx, audio_rx) = mpsc::channel(1);
        let mut updates = recognizer.recognize(audio_rx).unwrap();

        drop(audio_tx);
        assert_eq!(updates.recv().await, Some(TranscriptUpdate::Final(String::new())));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let recognizer = HttpRecognizer::new(settings()).unwrap();
        let (audio_tx, audio_rx) = mpsc::channel(1);
        let mut updates = recognizer.recognize(audio_rx).unwrap();

        audio_tx
            .send(AudioBuffer {
                samples: vec![0.0; 1024],
                sample_rate: 16_000,
            })
            .await
            .unwrap();
        drop(audio_tx);

        assert!(matches!(updates.recv().await, Some(TranscriptUpdate::Failed(_))));
    }

    #[tokio::test]
    async fn test_audio_is_drained_during_slow_transcription() {
        let base_url = slow_endpoint(Duration::from_millis(400), "make my phone ring").await;
        let recognizer = HttpRecognizer::new(HttpRecognizerSettings {
            base_url,
            window: Duration::from_millis(50),
            max_utterance: Duration::from_secs(60),
            ..settings()
        })
        .unwrap();

        let (audio_tx, audio_rx) = mpsc::channel(2);
        let mut updates = recognizer.recognize(audio_rx).unwrap();
        let buffer = AudioBuffer {
            samples: vec![0.0; 1024],
            sample_rate: 16_000,
        };

        audio_tx.send(buffer.clone()).await.unwrap();
        // Let a window pass so a partial request is out
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Far more buffers than the queue holds, all while the request is pending
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(
                audio_tx.try_send(buffer.clone()).is_ok(),
                "audio buffer dropped while transcribing"
            );
        }
        drop(audio_tx);

        let mut last = None;
        while let Some(update) = updates.recv().await {
            last = Some(update);
        }
        assert_eq!(
            last,
            Some(TranscriptUpdate::Final("make my phone ring".to_string()))
        );
    }
}
