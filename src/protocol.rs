//! Wire types of the voice session protocol
//!
//! Textual frames carry JSON control messages tagged by `type`. Binary frames
//! carry raw PCM16LE mono audio and have no envelope at all.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Sample rate of inbound audio unless `audio.start` says otherwise
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Speech synthesis engine on the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsEngine {
    #[default]
    Melo,
    Chatterbox,
}

impl TtsEngine {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Melo => "melo",
            Self::Chatterbox => "chatterbox",
        }
    }
}

impl fmt::Display for TtsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TtsEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "melo" => Ok(Self::Melo),
            "chatterbox" => Ok(Self::Chatterbox),
            other => Err(format!("unknown TTS engine '{other}' (expected melo or chatterbox)")),
        }
    }
}

/// Parameters of one conversation, fixed at session creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub personality: String,
    pub situation: String,
    pub voice_id: String,
    pub tts_engine: TtsEngine,
    pub language: String,
    pub user_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            personality: "Tu es un assistant vocal intelligent, chaleureux et naturel. \
                          Tu parles avec un ton décontracté, amical et engageant."
                .to_string(),
            situation: "Tu es dans une conversation vocale en temps réel. \
                        Réponds de manière concise et naturelle."
                .to_string(),
            voice_id: "fr_FR-melo-voice1".to_string(),
            tts_engine: TtsEngine::Melo,
            language: "fr-FR".to_string(),
            user_id: "default".to_string(),
        }
    }
}

impl SessionConfig {
    /// Apply the fields present in an update
    pub fn apply(&mut self, update: &SessionUpdate) {
        if let Some(voice_id) = non_empty(update.voice_id.as_deref()) {
            self.voice_id = voice_id.to_string();
        }
        if let Some(personality) = non_empty(update.personality.as_deref()) {
            self.personality = personality.to_string();
        }
        if let Some(situation) = non_empty(update.situation.as_deref()) {
            self.situation = situation.to_string();
        }
        if let Some(engine) = update.tts_engine {
            self.tts_engine = engine;
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Config as echoed back by the server (fields may be truncated or absent)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEcho {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub situation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_engine: Option<String>,
}

impl fmt::Display for ConfigEcho {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("voice", &self.voice_id),
            ("tts", &self.tts_engine),
            ("language", &self.language),
        ];
        let mut first = true;
        for (name, value) in fields {
            if let Some(value) = value {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{name}={value}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Partial replacement of the session config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub situation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_engine: Option<TtsEngine>,
}

impl SessionUpdate {
    /// Check if the update changes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        non_empty(self.voice_id.as_deref()).is_none()
            && non_empty(self.personality.as_deref()).is_none()
            && non_empty(self.situation.as_deref()).is_none()
            && self.tts_engine.is_none()
    }
}

const fn default_true() -> bool {
    true
}

const fn default_sample_rate() -> u32 {
    DEFAULT_OUTPUT_SAMPLE_RATE
}

const fn default_channels() -> u16 {
    1
}

/// Control message exchanged as a textual frame
///
/// Both directions share one taxonomy. Types this client does not know are
/// kept as [`ControlMessage::Unknown`] instead of failing the parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Server accepted the streaming connection
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<ConfigEcho>,
    },

    /// Recognized user speech (or echoed typed input)
    #[serde(rename = "transcription")]
    Transcription {
        text: String,
        #[serde(default = "default_true")]
        is_final: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },

    #[serde(rename = "response.start")]
    ResponseStart,

    #[serde(rename = "response.text")]
    ResponseText { text: String },

    #[serde(rename = "response.end")]
    ResponseEnd,

    /// Synthesized speech follows as binary frames
    #[serde(rename = "audio.start")]
    AudioStart {
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
    },

    #[serde(rename = "audio.end")]
    AudioEnd,

    /// Server-side failure, forwarded as text
    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "session.update")]
    SessionUpdate(SessionUpdate),

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<ConfigEcho>,
    },

    /// Typed user input, bypassing speech recognition
    #[serde(rename = "input.text")]
    InputText { text: String },

    #[serde(rename = "conversation.clear")]
    ConversationClear,

    #[serde(rename = "conversation.cleared")]
    ConversationCleared,

    #[serde(rename = "memory.clear")]
    MemoryClear,

    #[serde(rename = "memory.cleared")]
    MemoryCleared,

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,

    /// Any `type` not listed above
    #[serde(skip)]
    Unknown { kind: String },
}

impl ControlMessage {
    /// Every `type` tag with a dedicated variant
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "session.created",
        "transcription",
        "response.start",
        "response.text",
        "response.end",
        "audio.start",
        "audio.end",
        "error",
        "session.update",
        "session.updated",
        "input.text",
        "conversation.clear",
        "conversation.cleared",
        "memory.clear",
        "memory.cleared",
        "ping",
        "pong",
    ];

    /// Parse a textual frame
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the frame is not a JSON object with a
    /// string `type`, or if a known type is missing its fields
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| TransportError::ProtocolViolation(format!("invalid JSON: {e}")))?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                TransportError::ProtocolViolation("control message without a type".to_string())
            })?
            .to_string();

        if !Self::KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(Self::Unknown { kind });
        }

        serde_json::from_value(value)
            .map_err(|e| TransportError::ProtocolViolation(format!("invalid {kind} message: {e}")))
    }

    /// Serialize for sending as a textual frame
    ///
    /// # Errors
    ///
    /// Returns error for [`ControlMessage::Unknown`], which has no wire form
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// The `type` tag of this message
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::Transcription { .. } => "transcription",
            Self::ResponseStart => "response.start",
            Self::ResponseText { .. } => "response.text",
            Self::ResponseEnd => "response.end",
            Self::AudioStart { .. } => "audio.start",
            Self::AudioEnd => "audio.end",
            Self::Error { .. } => "error",
            Self::SessionUpdate(_) => "session.update",
            Self::SessionUpdated { .. } => "session.updated",
            Self::InputText { .. } => "input.text",
            Self::ConversationClear => "conversation.clear",
            Self::ConversationCleared => "conversation.cleared",
            Self::MemoryClear => "memory.clear",
            Self::MemoryCleared => "memory.cleared",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown { kind } => kind.as_str(),
        }
    }
}
