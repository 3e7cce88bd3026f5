//! Recognition pipeline: audio in, trigger detections out
//!
//! At most one [`RecognitionSession`] is active. A session ends on the first
//! trigger match, on a final transcript, or on a recognizer failure; the
//! caller re-arms with [`RecognitionPipeline::start_listening`]. Ending after
//! a match keeps a sustained utterance from firing twice.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::{AudioBuffer, AudioSource};
use super::recognizer::{SpeechRecognizer, TranscriptUpdate};
use super::trigger::TriggerPhrases;
use crate::{Error, Result};

/// Buffers queued between capture and recognizer
const AUDIO_QUEUE: usize = 32;

/// Identifies one listening session
pub type SessionId = u64;

/// A transcript update tagged with the session that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Producing session
    pub session: SessionId,

    /// The update
    pub update: TranscriptUpdate,
}

/// What handling a [`SessionEvent`] led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Still listening
    Pending,

    /// A trigger matched; the session is over
    Triggered {
        /// Matched phrase (normalized)
        phrase: String,
        /// Transcript it was found in
        transcript: String,
    },

    /// Final transcript without a match; the session is over
    Finished,

    /// Capture or recognizer fault; the session is over
    Failed(String),

    /// Event belongs to a session that is no longer current
    Stale,
}

/// State of the active session
#[derive(Debug)]
pub struct RecognitionSession {
    id: SessionId,
    triggers: TriggerPhrases,
    transcript: String,
    forwarder: JoinHandle<()>,
}

impl RecognitionSession {
    /// Session id
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Latest transcript seen in this session
    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Phrases this session listens for
    #[must_use]
    pub const fn triggers(&self) -> &TriggerPhrases {
        &self.triggers
    }
}

/// Owns the audio source, the recognizer, and the current session
pub struct RecognitionPipeline {
    source: Box<dyn AudioSource>,
    recognizer: Arc<dyn SpeechRecognizer>,
    session: Option<RecognitionSession>,
    next_session: SessionId,
    events: mpsc::Sender<SessionEvent>,
}

impl RecognitionPipeline {
    /// Create an idle pipeline reporting updates on `events`
    #[must_use]
    pub fn new(
        source: Box<dyn AudioSource>,
        recognizer: Arc<dyn SpeechRecognizer>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            source,
            recognizer,
            session: None,
            next_session: 1,
            events,
        }
    }

    /// Start a new session listening for `triggers`
    ///
    /// An active session is stopped first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Recognition`] if there is nothing to listen for or
    /// capture/recognition cannot start. Nothing is left running on error.
    pub fn start_listening(&mut self, triggers: &TriggerPhrases) -> Result<SessionId> {
        self.stop_listening();

        if triggers.is_empty() {
            return Err(Error::Recognition("no trigger phrases configured".to_string()));
        }

        let (audio_tx, audio_rx) = mpsc::channel::<AudioBuffer>(AUDIO_QUEUE);
        self.source
            .start(audio_tx)
            .map_err(|e| Error::Recognition(format!("capture failed: {e}")))?;

        let mut updates = match self.recognizer.recognize(audio_rx) {
            Ok(updates) => updates,
            Err(e) => {
                self.source.stop();
                return Err(e);
            }
        };

        let id = self.next_session;
        self.next_session += 1;

        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let terminal = update.is_terminal();
                if events.send(SessionEvent { session: id, update }).await.is_err() || terminal {
                    break;
                }
            }
        });

        tracing::info!(session = id, triggers = ?triggers.phrases(), "listening started");

        self.session = Some(RecognitionSession {
            id,
            triggers: triggers.clone(),
            transcript: String::new(),
            forwarder,
        });
        Ok(id)
    }

    /// Stop the active session, releasing capture
    ///
    /// Idempotent. Returns whether a session was running.
    pub fn stop_listening(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        self.source.stop();
        session.forwarder.abort();
        tracing::info!(session = session.id, "listening stopped");
        true
    }

    /// Feed one update through trigger matching
    ///
    /// Updates for any session other than the current one are discarded.
    pub fn handle(&mut self, event: SessionEvent) -> SessionOutcome {
        let Some(session) = self.session.as_mut().filter(|s| s.id == event.session) else {
            tracing::trace!(session = event.session, "discarding update from stale session");
            return SessionOutcome::Stale;
        };

        let (text, is_final) = match event.update {
            TranscriptUpdate::Partial(text) => (text, false),
            TranscriptUpdate::Final(text) => (text, true),
            TranscriptUpdate::Failed(reason) => {
                tracing::warn!(session = session.id, reason = %reason, "recognition failed");
                self.stop_listening();
                return SessionOutcome::Failed(reason);
            }
        };

        tracing::debug!(session = session.id, transcript = %text, is_final, "transcript update");

        if let Some(phrase) = session.triggers.find_in(&text).map(ToString::to_string) {
            tracing::info!(session = session.id, phrase = %phrase, transcript = %text, "trigger fired");
            self.stop_listening();
            return SessionOutcome::Triggered {
                phrase,
                transcript: text,
            };
        }

        session.transcript = text;
        if is_final {
            self.stop_listening();
            return SessionOutcome::Finished;
        }

        SessionOutcome::Pending
    }

    /// Whether a session is active
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.session.is_some()
    }

    /// The active session, if any
    #[must_use]
    pub const fn session(&self) -> Option<&RecognitionSession> {
        self.session.as_ref()
    }

    /// Whether the audio source currently holds the device
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.source.is_capturing()
    }
}

impl Drop for RecognitionPipeline {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
