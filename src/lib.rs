//! Beacon Ring - voice-triggered command relay between paired devices
//!
//! Two roles share one local network:
//! - The controller advertises itself over mDNS, accepts a single peer, and
//!   listens for a trigger phrase. A match sends `RING` to the peer.
//! - The companion browses for the controller, connects, and plays a local
//!   alert whenever `RING` arrives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── Controller ────────────────┐      ┌────────── Companion ──────────┐
//! │ Microphone → Recognizer → Trigger phrases  │      │ Browse (mDNS)                 │
//! │                   │                        │      │   │                           │
//! │                   ▼                        │ RING │   ▼                           │
//! │ Advertise (mDNS) + Connection manager ─────┼──────┼─► Connection manager → Alert  │
//! └────────────────────────────────────────────┘      └───────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod voice;

pub use config::Config;
pub use connection::{Connection, ConnectionEvent, ConnectionManager, ConnectionState, Listener};
pub use discovery::{
    AdvertiseHandle, DiscoveredEndpoint, DiscoveryEvent, MdnsDirectory, MemoryDirectory,
    ServiceDescriptor, ServiceDirectory,
};
pub use dispatcher::{
    Companion, CompanionHandle, CompanionPhase, Controller, ControllerHandle, ControllerOptions,
    ControllerPhase,
};
pub use error::{Error, Result};
pub use protocol::{Command, Message};
pub use voice::{
    AlertAction, AudioBuffer, AudioSource, HttpRecognizer, LogAlert, MicrophoneSource,
    RecognitionPipeline, SpeechRecognizer, ToneAlert, TranscriptUpdate, TriggerPhrases,
};
