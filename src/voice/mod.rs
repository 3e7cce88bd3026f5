//! Voice processing module
//!
//! Handles audio capture, speech recognition, trigger matching, and the
//! companion's alert playback.

mod alert;
mod capture;
mod pipeline;
mod recognizer;
mod trigger;

pub use alert::{AlertAction, LogAlert, ToneAlert, ToneSettings};
pub use capture::{AudioBuffer, AudioSource, BUFFER_FRAMES, MicrophoneSource, samples_to_wav};
pub use pipeline::{
    RecognitionPipeline, RecognitionSession, SessionEvent, SessionId, SessionOutcome,
};
pub use recognizer::{HttpRecognizer, HttpRecognizerSettings, SpeechRecognizer, TranscriptUpdate};
pub use trigger::TriggerPhrases;
