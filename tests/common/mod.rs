//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_ring::voice::{AlertAction, AudioBuffer, AudioSource, SpeechRecognizer};
use beacon_ring::{Error, Result, TranscriptUpdate};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, panicking after [`WAIT`]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct FakeSourceState {
    starts: AtomicUsize,
    stops: AtomicUsize,
    capturing: AtomicBool,
    sink: Mutex<Option<mpsc::Sender<AudioBuffer>>>,
}

/// Audio source that records start/stop calls instead of touching hardware
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<FakeSourceState>,
}

impl FakeSource {
    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls, including redundant ones
    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn capturing(&self) -> bool {
        self.state.capturing.load(Ordering::SeqCst)
    }
}

impl AudioSource for FakeSource {
    fn start(&mut self, sink: mpsc::Sender<AudioBuffer>) -> Result<()> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        self.state.capturing.store(true, Ordering::SeqCst);
        *self.state.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.state.capturing.store(false, Ordering::SeqCst);
        self.state.sink.lock().unwrap().take();
    }

    fn is_capturing(&self) -> bool {
        self.capturing()
    }
}

#[derive(Default)]
struct ManualState {
    sessions: Mutex<Vec<mpsc::Sender<TranscriptUpdate>>>,
    audio: Mutex<Vec<mpsc::Receiver<AudioBuffer>>>,
    refuse: AtomicBool,
}

/// Recognizer whose transcript updates are pushed by the test
#[derive(Clone, Default)]
pub struct ManualRecognizer {
    state: Arc<ManualState>,
}

impl ManualRecognizer {
    /// Make every following `recognize` call fail
    pub fn refuse(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }

    /// Number of recognitions started so far
    pub fn sessions(&self) -> usize {
        self.state.sessions.lock().unwrap().len()
    }

    /// Push an update into the most recent recognition
    pub async fn push(&self, update: TranscriptUpdate) {
        let tx = self
            .state
            .sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no recognition started");
        let _ = tx.send(update).await;
    }

    pub async fn partial(&self, text: &str) {
        self.push(TranscriptUpdate::Partial(text.to_string())).await;
    }
}

impl SpeechRecognizer for ManualRecognizer {
    fn recognize(
        &self,
        audio: mpsc::Receiver<AudioBuffer>,
    ) -> Result<mpsc::Receiver<TranscriptUpdate>> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(Error::Recognition("recognizer offline".to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        self.state.sessions.lock().unwrap().push(tx);
        self.state.audio.lock().unwrap().push(audio);
        Ok(rx)
    }
}

/// Alert that counts how often it was started
#[derive(Default)]
pub struct CountingAlert {
    started: AtomicUsize,
    duration: Duration,
}

impl CountingAlert {
    /// Alert that takes `duration` to finish
    pub fn lasting(duration: Duration) -> Self {
        Self {
            started: AtomicUsize::new(0),
            duration,
        }
    }

    pub fn count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertAction for CountingAlert {
    async fn alert(&self) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        Ok(())
    }
}
