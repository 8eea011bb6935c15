//! Configuration management for the voice client

pub mod file;

use std::time::Duration;

use crate::audio::{FRAME_SAMPLES, PLAYBACK_SAMPLE_RATE};
use crate::event_log;
use crate::handshake::HandshakeClient;
use crate::protocol::{SessionConfig, TtsEngine};
use crate::session::SessionOptions;
use crate::{Error, Result};

use self::file::VocalConfigFile;

/// Server used when nothing else is configured
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8765";

/// Default timeout of REST calls
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Voice client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the voice agent server
    pub server_url: String,

    /// Static API key (from `VOCAL_API_KEY` env)
    pub api_key: Option<String>,

    /// Timeout of REST calls
    pub request_timeout: Duration,

    /// Interval of keepalive pings while a session is active
    pub keepalive: Option<Duration>,

    /// Defaults for new sessions
    pub session: SessionConfig,

    /// Samples per outbound microphone frame
    pub frame_samples: usize,

    /// Output rate of the playback context
    pub playback_sample_rate: u32,

    /// Entries retained in the event log
    pub log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            keepalive: None,
            session: SessionConfig::default(),
            frame_samples: FRAME_SAMPLES,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            log_capacity: event_log::DEFAULT_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn from_sources(
        fc: VocalConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let server_url = env("VOCAL_SERVER_URL")
            .or(fc.server.url)
            .unwrap_or(defaults.server_url);
        let api_key = env("VOCAL_API_KEY").or(fc.server.api_key);

        let request_timeout = env("VOCAL_REQUEST_TIMEOUT_SECS")
            .map(|v| parse_number::<u64>("VOCAL_REQUEST_TIMEOUT_SECS", &v))
            .transpose()?
            .or(fc.server.request_timeout_secs)
            .map_or(defaults.request_timeout, Duration::from_secs);
        if request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be positive".to_string()));
        }

        let keepalive = env("VOCAL_KEEPALIVE_SECS")
            .map(|v| parse_number::<u64>("VOCAL_KEEPALIVE_SECS", &v))
            .transpose()?
            .or(fc.server.keepalive_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        // Session defaults (env > toml > server defaults)
        let base = defaults.session;
        let tts_engine = match env("VOCAL_TTS_ENGINE").or(fc.session.tts_engine) {
            Some(name) => name.parse::<TtsEngine>().map_err(Error::Config)?,
            None => base.tts_engine,
        };
        let session = SessionConfig {
            personality: env("VOCAL_PERSONALITY")
                .or(fc.session.personality)
                .unwrap_or(base.personality),
            situation: env("VOCAL_SITUATION")
                .or(fc.session.situation)
                .unwrap_or(base.situation),
            voice_id: env("VOCAL_VOICE_ID")
                .or(fc.session.voice_id)
                .unwrap_or(base.voice_id),
            tts_engine,
            language: env("VOCAL_LANGUAGE")
                .or(fc.session.language)
                .unwrap_or(base.language),
            user_id: env("VOCAL_USER_ID")
                .or(fc.session.user_id)
                .unwrap_or(base.user_id),
        };

        let frame_samples = fc.audio.frame_samples.unwrap_or(defaults.frame_samples);
        if frame_samples == 0 {
            return Err(Error::Config("audio.frame_samples must be positive".to_string()));
        }
        let playback_sample_rate = fc
            .audio
            .playback_sample_rate
            .unwrap_or(defaults.playback_sample_rate);
        if playback_sample_rate == 0 {
            return Err(Error::Config(
                "audio.playback_sample_rate must be positive".to_string(),
            ));
        }

        let log_capacity = fc.log.capacity.unwrap_or(defaults.log_capacity).max(1);

        Ok(Self {
            server_url,
            api_key,
            request_timeout,
            keepalive,
            session,
            frame_samples,
            playback_sample_rate,
            log_capacity,
        })
    }

    /// Options for a [`crate::VoiceSession`] built from this config
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            frame_samples: self.frame_samples,
            playback_sample_rate: self.playback_sample_rate,
            keepalive: self.keepalive,
            ..SessionOptions::default()
        }
    }

    /// REST client for the configured server
    ///
    /// # Errors
    ///
    /// Returns error if the server URL is invalid
    pub fn handshake_client(&self) -> Result<HandshakeClient> {
        HandshakeClient::new(&self.server_url, self.api_key.clone(), self.request_timeout)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(VocalConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.frame_samples, 4096);
        assert_eq!(config.playback_sample_rate, 24_000);
        assert_eq!(config.log_capacity, 500);
        assert_eq!(config.session.voice_id, "fr_FR-melo-voice1");
        assert_eq!(config.session.tts_engine, TtsEngine::Melo);
        assert!(config.keepalive.is_none());
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: VocalConfigFile = toml::from_str(
            r#"
            [server]
            url = "http://file-host:1"
            keepalive_secs = 15

            [session]
            voice_id = "from-file"
            language = "en-US"
            "#,
        )
        .unwrap();
        let env = env_of(&[
            ("VOCAL_SERVER_URL", "http://env-host:2"),
            ("VOCAL_VOICE_ID", "from-env"),
            ("VOCAL_TTS_ENGINE", "Chatterbox"),
        ]);

        let config = Config::from_sources(fc, env).unwrap();
        assert_eq!(config.server_url, "http://env-host:2");
        assert_eq!(config.session.voice_id, "from-env");
        assert_eq!(config.session.language, "en-US");
        assert_eq!(config.session.tts_engine, TtsEngine::Chatterbox);
        assert_eq!(config.keepalive, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_blank_env_ignored() {
        let config =
            Config::from_sources(VocalConfigFile::default(), env_of(&[("VOCAL_API_KEY", " ")]))
                .unwrap();
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_sources(
            VocalConfigFile::default(),
            env_of(&[("VOCAL_TTS_ENGINE", "espeak")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_sources(
            VocalConfigFile::default(),
            env_of(&[("VOCAL_KEEPALIVE_SECS", "soon")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let fc: VocalConfigFile = toml::from_str("[audio]\nframe_samples = 0").unwrap();
        assert!(Config::from_sources(fc, env_of(&[])).is_err());
    }

    #[test]
    fn test_session_options_follow_config() {
        let fc: VocalConfigFile =
            toml::from_str("[audio]\nframe_samples = 2048\n[server]\nkeepalive_secs = 0").unwrap();
        let config = Config::from_sources(fc, env_of(&[])).unwrap();
        let options = config.session_options();
        assert_eq!(options.frame_samples, 2048);
        assert!(options.keepalive.is_none());
        assert_eq!(options.capture.sample_rate, 16_000);
    }
}
