//! Configuration management for beacon-ring
//!
//! Precedence is env > TOML file > defaults.

pub mod file;

use std::time::Duration;

use crate::discovery::{SERVICE_TYPE, ServiceDescriptor};
use crate::dispatcher::ControllerOptions;
use crate::voice::{HttpRecognizerSettings, ToneSettings, TriggerPhrases};
use crate::{Error, Result};

pub use file::{ConfigFile, config_file_path, load_config_file, read_config_file};

/// Trigger phrase used when none is configured
pub const DEFAULT_TRIGGER: &str = "make my phone ring";

/// Default OpenAI-compatible STT endpoint
pub const DEFAULT_STT_URL: &str = "https://api.openai.com/v1";

/// Default STT model
pub const DEFAULT_STT_MODEL: &str = "whisper-1";

/// beacon-ring configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Advertised service
    pub service: ServiceConfig,

    /// Controller behaviour
    pub controller: ControllerConfig,

    /// Speech recognizer
    pub recognizer: RecognizerConfig,

    /// Companion alert
    pub alert: ToneSettings,
}

/// Service advertisement configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Instance name
    pub name: String,

    /// Service type tag
    pub service_type: String,

    /// Fixed listening port
    pub port: Option<u16>,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Trigger phrases
    pub triggers: Vec<String>,

    /// Start listening automatically while a peer is connected
    pub listen_on_connect: bool,
}

/// Speech recognizer configuration
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// API base URL
    pub base_url: String,

    /// Transcription model
    pub model: String,

    /// API key
    pub api_key: Option<String>,

    /// Re-transcription interval
    pub window: Duration,

    /// Maximum utterance length
    pub max_utterance: Duration,
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed
    pub fn load() -> Result<Self> {
        Self::from_sources(load_config_file(), |key| std::env::var(key).ok())
    }

    /// Assemble configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed
    pub fn from_sources(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match env("BEACON_RING_PORT") {
            Some(raw) => Some(
                raw.parse::<u16>()
                    .map_err(|e| Error::Config(format!("invalid BEACON_RING_PORT {raw:?}: {e}")))?,
            ),
            None => fc.service.port,
        };

        let service = ServiceConfig {
            name: env("BEACON_RING_NAME")
                .or(fc.service.name)
                .unwrap_or_else(default_name),
            service_type: env("BEACON_RING_SERVICE_TYPE")
                .or(fc.service.service_type)
                .unwrap_or_else(|| SERVICE_TYPE.to_string()),
            port,
        };

        let triggers = env("BEACON_RING_TRIGGERS")
            .map(|raw| raw.split(',').map(|t| t.trim().to_string()).collect())
            .or(fc.controller.triggers)
            .unwrap_or_else(|| vec![DEFAULT_TRIGGER.to_string()]);

        let controller = ControllerConfig {
            triggers,
            listen_on_connect: fc.controller.listen_on_connect.unwrap_or(true),
        };

        let recognizer = RecognizerConfig {
            base_url: env("BEACON_RING_STT_URL")
                .or(fc.recognizer.base_url)
                .unwrap_or_else(|| DEFAULT_STT_URL.to_string()),
            model: env("BEACON_RING_STT_MODEL")
                .or(fc.recognizer.model)
                .unwrap_or_else(|| DEFAULT_STT_MODEL.to_string()),
            api_key: env("OPENAI_API_KEY").or(fc.recognizer.api_key),
            window: Duration::from_millis(fc.recognizer.window_ms.unwrap_or(750)),
            max_utterance: Duration::from_millis(fc.recognizer.max_utterance_ms.unwrap_or(8_000)),
        };

        let defaults = ToneSettings::default();
        let alert = ToneSettings {
            frequency_hz: fc.alert.frequency_hz.unwrap_or(defaults.frequency_hz),
            tone: fc.alert.tone_ms.map_or(defaults.tone, Duration::from_millis),
            repeats: fc.alert.repeats.unwrap_or(defaults.repeats),
        };

        Ok(Self {
            service,
            controller,
            recognizer,
            alert,
        })
    }

    /// Descriptor for the advertised service
    #[must_use]
    pub fn descriptor(&self) -> ServiceDescriptor {
        let descriptor = ServiceDescriptor::new(&self.service.name, &self.service.service_type);
        match self.service.port {
            Some(port) => descriptor.with_port(port),
            None => descriptor,
        }
    }

    /// Controller options derived from this configuration
    #[must_use]
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            triggers: TriggerPhrases::new(&self.controller.triggers),
            listen_on_connect: self.controller.listen_on_connect,
        }
    }

    /// Recognizer settings derived from this configuration
    #[must_use]
    pub fn recognizer_settings(&self) -> HttpRecognizerSettings {
        HttpRecognizerSettings {
            base_url: self.recognizer.base_url.clone(),
            api_key: self.recognizer.api_key.clone(),
            model: self.recognizer.model.clone(),
            window: self.recognizer.window,
            max_utterance: self.recognizer.max_utterance,
        }
    }
}

fn default_name() -> String {
    hostname::get().map_or_else(
        |_| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("beacon-ring-{}", &id[..8])
        },
        |h| h.to_string_lossy().to_string(),
    )
}
