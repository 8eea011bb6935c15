//! TOML configuration file loading
//!
//! Supports `~/.config/vocal-live/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VocalConfigFile {
    /// Voice agent server connection
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Defaults for new sessions
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Audio pipeline tuning
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Event log settings
    #[serde(default)]
    pub log: LogFileConfig,
}

/// Server connection configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Base URL of the server (e.g. "http://localhost:8765")
    pub url: Option<String>,

    /// Static API key
    pub api_key: Option<String>,

    /// Timeout of REST calls
    pub request_timeout_secs: Option<u64>,

    /// Interval of keepalive pings (0 or absent disables them)
    pub keepalive_secs: Option<u64>,
}

/// Session defaults
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub personality: Option<String>,
    pub situation: Option<String>,
    pub voice_id: Option<String>,
    /// "melo" or "chatterbox"
    pub tts_engine: Option<String>,
    pub language: Option<String>,
    pub user_id: Option<String>,
}

/// Audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per outbound microphone frame
    pub frame_samples: Option<usize>,

    /// Output rate of the playback context
    pub playback_sample_rate: Option<u32>,
}

/// Event log configuration
#[derive(Debug, Default, Deserialize)]
pub struct LogFileConfig {
    /// Entries retained in the event log
    pub capacity: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VocalConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VocalConfigFile {
    config_file_path().map_or_else(VocalConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file, falling back to defaults on any problem
pub fn load_config_from(path: &Path) -> VocalConfigFile {
    if !path.exists() {
        return VocalConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VocalConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VocalConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/vocal-live/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("vocal-live").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let file: VocalConfigFile = toml::from_str(
            r#"
            [server]
            url = "https://voice.example"
            keepalive_secs = 30

            [session]
            voice_id = "fr_FR-siwis"
            tts_engine = "chatterbox"
            "#,
        )
        .unwrap();

        assert_eq!(file.server.url.as_deref(), Some("https://voice.example"));
        assert_eq!(file.server.keepalive_secs, Some(30));
        assert_eq!(file.session.tts_engine.as_deref(), Some("chatterbox"));
        assert!(file.audio.frame_samples.is_none());
        assert!(file.log.capacity.is_none());
    }

    #[test]
    fn test_unknown_section_rejected() {
        assert!(toml::from_str::<VocalConfigFile>("[llm]\nmodel = \"x\"").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let file = load_config_from(Path::new("/nonexistent/vocal-live/config.toml"));
        assert!(file.server.url.is_none());
    }
}
