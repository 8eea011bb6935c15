//! Vocal Live - Real-time voice conversation client
//!
//! This library provides the client side of a full-duplex voice session:
//! - Session handshake over REST
//! - One websocket carrying JSON control frames and PCM16 audio frames
//! - Microphone capture and gapless speaker playback
//! - A session state machine and a bounded event log
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   VoiceSession                       │
//! │   state machine  │  control dispatch  │  event log  │
//! └──────┬──────────────────┬──────────────────┬────────┘
//!        │ handshake        │ text frames      │ binary frames
//! ┌──────▼───────┐   ┌──────▼──────────────────▼────────┐
//! │  REST client │   │        Streaming transport        │
//! │ /start-session│  │  capture ──▶ send │ recv ──▶ play │
//! └──────────────┘   └───────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod event_log;
pub mod handshake;
pub mod protocol;
pub mod session;
pub mod transport;

pub use audio::{AudioBackend, CaptureConstraints, CpalBackend};
pub use config::Config;
pub use error::{Error, Result};
pub use event_log::{EventLog, LogCategory, LogEntry};
pub use handshake::{HandshakeClient, SessionGrant};
pub use protocol::{ControlMessage, SessionConfig, SessionUpdate, TtsEngine};
pub use session::{Session, SessionOptions, SessionState, VoiceSession};
pub use transport::{Connection, TransportEvent};
