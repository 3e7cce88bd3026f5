//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-ring/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Advertised service
    #[serde(default)]
    pub service: ServiceFileConfig,

    /// Controller behaviour
    #[serde(default)]
    pub controller: ControllerFileConfig,

    /// Speech recognizer endpoint
    #[serde(default)]
    pub recognizer: RecognizerFileConfig,

    /// Companion alert
    #[serde(default)]
    pub alert: AlertFileConfig,
}

/// Service advertisement configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServiceFileConfig {
    /// Instance name (defaults to the host name)
    pub name: Option<String>,

    /// Service type tag, must match on both devices
    pub service_type: Option<String>,

    /// Fixed listening port (OS-assigned when unset)
    pub port: Option<u16>,
}

/// Controller configuration
#[derive(Debug, Default, Deserialize)]
pub struct ControllerFileConfig {
    /// Trigger phrases
    pub triggers: Option<Vec<String>>,

    /// Start listening automatically while a peer is connected
    pub listen_on_connect: Option<bool>,
}

/// Recognizer configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognizerFileConfig {
    /// API base URL
    pub base_url: Option<String>,

    /// Transcription model
    pub model: Option<String>,

    /// API key
    pub api_key: Option<String>,

    /// Re-transcription interval in milliseconds
    pub window_ms: Option<u64>,

    /// Maximum utterance length in milliseconds
    pub max_utterance_ms: Option<u64>,
}

/// Alert configuration
#[derive(Debug, Default, Deserialize)]
pub struct AlertFileConfig {
    /// Tone pitch
    pub frequency_hz: Option<f32>,

    /// Beep length in milliseconds
    pub tone_ms: Option<u64>,

    /// Number of beeps
    pub repeats: Option<u32>,
}

/// Parse a config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-ring/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-ring")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[service]\nname = \"kitchen\"\n\n[controller]\ntriggers = [\"ring it\"]"
        )
        .unwrap();

        let config = read_config_file(file.path()).unwrap();
        assert_eq!(config.service.name.as_deref(), Some("kitchen"));
        assert!(config.service.port.is_none());
        assert_eq!(config.controller.triggers, Some(vec!["ring it".to_string()]));
        assert!(config.recognizer.base_url.is_none());
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[service\nname = ").unwrap();
        tokio_test::assert_err!(read_config_file(file.path()));
    }
}
