//! Voice session state machine
//!
//! [`VoiceSession`] owns everything one conversation needs: the handshake
//! client, the streaming connection, the capture and playback pipelines and
//! the event log. Inbound control messages only ever produce log entries and
//! a couple of UI flags; inbound audio goes straight to playback.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──open──▶ Active ──disconnect──▶ Closing ──close──▶ Closed
//!   ▲                   │                  │                                      │
//!   └── handshake error ┘                  └──────── transport error ────────────▶┘
//! ```

mod state;

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::audio::{
    AudioBackend, CaptureConstraints, CapturePipeline, FRAME_SAMPLES, PLAYBACK_SAMPLE_RATE,
    PlaybackPipeline,
};
use crate::error::TransportError;
use crate::event_log::EventLog;
use crate::handshake::{HandshakeClient, redact};
use crate::protocol::{ControlMessage, SessionConfig, SessionUpdate};
use crate::transport::{Connection, TransportEvent};
use crate::{Error, Result};

pub use state::{Session, SessionState};

/// Upper bound on waiting for the peer's close during `disconnect`
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables of a [`VoiceSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Microphone constraints
    pub capture: CaptureConstraints,
    /// Samples per outbound frame
    pub frame_samples: usize,
    /// Rate of the playback context
    pub playback_sample_rate: u32,
    /// Period of keepalive pings while active
    pub keepalive: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            capture: CaptureConstraints::default(),
            frame_samples: FRAME_SAMPLES,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            keepalive: None,
        }
    }
}

/// Client side of one real-time voice conversation at a time
pub struct VoiceSession {
    state: SessionState,
    session: Option<Session>,
    handshake: HandshakeClient,
    connection: Option<Connection>,
    backend: Box<dyn AudioBackend>,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    log: EventLog,
    keepalive_period: Option<Duration>,
    keepalive: Option<Interval>,
    failure: Option<TransportError>,
    playing: bool,
    responding: bool,
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("state", &self.state)
            .field("session", &self.session.as_ref().map(|s| s.id.as_str()))
            .field("recording", &self.capture.is_recording())
            .field("playing", &self.playing)
            .finish_non_exhaustive()
    }
}

impl VoiceSession {
    /// Create an idle session machine
    #[must_use]
    pub fn new(
        handshake: HandshakeClient,
        backend: Box<dyn AudioBackend>,
        log: EventLog,
        options: SessionOptions,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            session: None,
            handshake,
            connection: None,
            backend,
            capture: CapturePipeline::new(options.capture, options.frame_samples),
            playback: PlaybackPipeline::new(options.playback_sample_rate),
            log,
            keepalive_period: options.keepalive.filter(|p| !p.is_zero()),
            keepalive: None,
            failure: None,
            playing: false,
            responding: false,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The current (or last) session
    #[must_use]
    pub const fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Event log shared with this session
    #[must_use]
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// REST client used for the handshake
    #[must_use]
    pub const fn handshake(&self) -> &HandshakeClient {
        &self.handshake
    }

    /// Check if a streaming connection is held
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Check if the microphone is streaming
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    /// Check if agent speech is being received
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.playing
    }

    /// Check if the agent is producing a response
    #[must_use]
    pub const fn is_responding(&self) -> bool {
        self.responding
    }

    /// Create a session and open its streaming connection
    ///
    /// Performs a single handshake attempt, then waits until the connection
    /// is open or has failed. Every failure is also written to the log.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless idle or closed, the handshake error if
    /// session creation fails (state returns to `Idle`), or the transport
    /// error if the connection never opens (state becomes `Closed`)
    #[allow(clippy::future_not_send)]
    pub async fn connect(&mut self, config: SessionConfig) -> Result<()> {
        if !self.state.can_connect() {
            return Err(Error::InvalidState(format!(
                "cannot connect while {}",
                self.state
            )));
        }

        self.state = SessionState::Connecting;
        self.failure = None;

        let grant = match self.handshake.create_session(&config).await {
            Ok(grant) => grant,
            Err(e) => {
                self.log.error(format!("Session creation failed: {e}"));
                self.state = SessionState::Idle;
                return Err(e.into());
            }
        };

        tracing::debug!(
            session_id = %grant.session_id,
            endpoint = %redact(&grant.endpoint),
            "opening streaming connection"
        );
        self.connection = Some(Connection::connect(grant.endpoint.as_str()));
        self.session = Some(Session {
            id: grant.session_id,
            config,
            echoed: grant.config,
            endpoint: grant.endpoint,
        });

        while self.state == SessionState::Connecting {
            if !self.process_next().await {
                break;
            }
        }

        if self.state == SessionState::Active {
            Ok(())
        } else {
            let reason = self.failure.clone().unwrap_or_else(|| {
                TransportError::ConnectFailed("connection closed before opening".to_string())
            });
            Err(reason.into())
        }
    }

    /// Wait for the next transport event and apply it
    ///
    /// Sends keepalive pings while waiting, if configured. Returns `false`
    /// when there is no connection to wait on.
    #[allow(clippy::future_not_send)]
    pub async fn process_next(&mut self) -> bool {
        loop {
            let Some(connection) = self.connection.as_mut() else {
                return false;
            };

            let event = if let Some(ticker) = self.keepalive.as_mut() {
                tokio::select! {
                    event = connection.next_event() => event,
                    _ = ticker.tick() => {
                        if !connection.send_text(&ControlMessage::Ping) {
                            tracing::debug!("keepalive ping dropped");
                        }
                        continue;
                    }
                }
            } else {
                connection.next_event().await
            };

            self.handle_event(event.unwrap_or(TransportEvent::Closed(None)));
            return true;
        }
    }

    /// Apply every event that has already arrived, without waiting
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self
            .connection
            .as_mut()
            .and_then(Connection::try_next_event)
        {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Send typed user input, bypassing speech recognition
    ///
    /// Sends only if the trimmed text is non-empty and a connection exists.
    /// On send the text is logged and `draft` is cleared.
    pub fn send_text(&mut self, draft: &mut String) -> bool {
        let text = draft.trim();
        if text.is_empty() {
            return false;
        }
        let Some(connection) = self.connection.as_ref() else {
            return false;
        };

        if !connection.send_text(&ControlMessage::InputText {
            text: text.to_string(),
        }) {
            tracing::debug!("input text dropped, connection not open");
            return false;
        }

        self.log.user(text);
        draft.clear();
        true
    }

    /// Start streaming the microphone to the server
    ///
    /// Failures are logged; the session stays active without recording.
    pub fn start_recording(&mut self) -> bool {
        if self.capture.is_recording() {
            return true;
        }
        let Some(connection) = self
            .connection
            .as_ref()
            .filter(|_| self.state == SessionState::Active)
        else {
            tracing::debug!(state = %self.state, "not recording, session not active");
            return false;
        };

        let sink = connection.audio_sender();
        match self.capture.start(self.backend.as_ref(), sink) {
            Ok(()) => {
                self.log.audio("Recording started");
                true
            }
            Err(e) => {
                self.log.error(format!("Microphone error: {e}"));
                false
            }
        }
    }

    /// Stop the microphone; no-op if not recording
    pub fn stop_recording(&mut self) {
        if !self.capture.is_recording() {
            return;
        }
        if let Some(handle) = self.capture.handle() {
            tracing::debug!(
                sent = handle.frames_sent(),
                dropped = handle.frames_dropped(),
                "capture stopping"
            );
        }
        self.capture.stop();
        self.log.audio("Recording stopped");
    }

    /// Change voice, personality, situation or TTS engine mid-session
    ///
    /// Non-empty fields are mirrored into the local config for display.
    pub fn update_session(&mut self, update: SessionUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        if !self.send_control(&ControlMessage::SessionUpdate(update.clone())) {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.config.apply(&update);
        }
        true
    }

    /// Ask the server to forget the conversation history
    pub fn clear_conversation(&self) -> bool {
        self.send_control(&ControlMessage::ConversationClear)
    }

    /// Ask the server to drop the user's long-term memories
    pub fn clear_memory(&self) -> bool {
        self.send_control(&ControlMessage::MemoryClear)
    }

    /// Check liveness; the server answers with `pong`
    pub fn ping(&self) -> bool {
        self.send_control(&ControlMessage::Ping)
    }

    /// Close the session
    ///
    /// Stops capture, sends a close frame and waits a bounded time for the
    /// peer to answer. Idempotent: a second call logs nothing.
    #[allow(clippy::future_not_send)]
    pub async fn disconnect(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Closed => return,
            SessionState::Closing => {}
            SessionState::Connecting | SessionState::Active => {
                self.state = SessionState::Closing;
                self.stop_recording();
                if let Some(connection) = self.connection.as_mut() {
                    connection.close();
                }
            }
        }

        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while self.state == SessionState::Closing {
            match tokio::time::timeout_at(deadline, self.process_next()).await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    tracing::debug!("close not confirmed by peer, forcing closed");
                    self.finish(None);
                }
            }
        }
    }

    fn send_control(&self, message: &ControlMessage) -> bool {
        let sent = self
            .connection
            .as_ref()
            .is_some_and(|connection| connection.send_text(message));
        if !sent {
            tracing::debug!(kind = message.kind(), "control message not sent");
        }
        sent
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Text(text) => match ControlMessage::parse(&text) {
                Ok(message) => self.dispatch(message),
                Err(e) => self.log.error(e.to_string()),
            },
            TransportEvent::Binary(frame) => self.on_audio(frame),
            TransportEvent::Error(e) => {
                if self.state == SessionState::Closing {
                    tracing::debug!(error = %e, "transport error while closing");
                } else {
                    self.log.error(format!("Connection error: {e}"));
                    self.failure = Some(e);
                }
            }
            TransportEvent::Closed(code) => self.finish(code),
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        self.state = SessionState::Active;

        let id = self.session.as_ref().map_or("?", |s| s.id.as_str());
        self.log.system(format!("Session created: {id}"));

        self.keepalive = self.keepalive_period.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
    }

    fn on_audio(&mut self, frame: Vec<u8>) {
        if self.state != SessionState::Active {
            tracing::trace!(bytes = frame.len(), state = %self.state, "audio frame ignored");
            return;
        }
        if let Err(e) = self.playback.enqueue(self.backend.as_ref(), frame) {
            self.log.error(format!("Playback error: {e}"));
        }
    }

    fn dispatch(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::SessionCreated { session_id, config } => {
                if let (Some(session), Some(config)) = (self.session.as_mut(), config) {
                    session.echoed = config;
                }
                let id = session_id
                    .or_else(|| self.session.as_ref().map(|s| s.id.clone()))
                    .unwrap_or_default();
                match self.session.as_ref().map(|s| s.echoed.to_string()) {
                    Some(echo) if !echo.is_empty() => {
                        self.log.system(format!("Server ready for {id} ({echo})"));
                    }
                    _ => self.log.system(format!("Server ready for {id}")),
                }
            }
            ControlMessage::Transcription {
                text,
                is_final,
                source,
            } => {
                if source.as_deref() == Some("text") {
                    // Echo of typed input, already logged when sent
                    tracing::debug!(text = %text, "typed input acknowledged");
                } else if is_final {
                    self.log.user(text);
                } else {
                    self.log.user(format!("{text}…"));
                }
            }
            ControlMessage::ResponseStart => {
                self.responding = true;
                self.log.system("Agent is responding");
            }
            ControlMessage::ResponseText { text } => self.log.agent(text),
            ControlMessage::ResponseEnd => {
                self.responding = false;
                self.log.system("Response complete");
            }
            ControlMessage::AudioStart {
                sample_rate,
                channels,
            } => {
                if channels != 1 {
                    tracing::warn!(channels, "multi-channel audio announced, treating as mono");
                }
                self.playback.set_input_rate(sample_rate);
                self.playing = true;
                self.log.audio(format!("Agent speaking ({sample_rate} Hz)"));
            }
            ControlMessage::AudioEnd => {
                self.playback.finish_utterance();
                self.playing = false;
                self.log.audio("Agent finished speaking");
            }
            ControlMessage::Error { message } => self.log.error(message),
            ControlMessage::SessionUpdated { config } => {
                let shown = config.as_ref().map(ToString::to_string).unwrap_or_default();
                if let (Some(session), Some(config)) = (self.session.as_mut(), config) {
                    session.echoed = config;
                }
                if shown.is_empty() {
                    self.log.system("Session updated");
                } else {
                    self.log.system(format!("Session updated ({shown})"));
                }
            }
            ControlMessage::ConversationCleared => self.log.system("Conversation cleared"),
            ControlMessage::MemoryCleared => self.log.system("Memory cleared"),
            ControlMessage::Pong => tracing::trace!("pong"),
            ControlMessage::Unknown { kind } => {
                self.log.system(format!("Unhandled message type: {kind}"));
            }
            outbound @ (ControlMessage::SessionUpdate(_)
            | ControlMessage::InputText { .. }
            | ControlMessage::ConversationClear
            | ControlMessage::MemoryClear
            | ControlMessage::Ping) => {
                self.log
                    .system(format!("Unhandled message type: {}", outbound.kind()));
            }
        }
    }

    fn finish(&mut self, code: Option<u16>) {
        if self.state == SessionState::Closed {
            return;
        }
        let requested = self.state == SessionState::Closing;

        self.capture.stop();
        self.playback.close();
        self.connection = None;
        self.keepalive = None;
        self.playing = false;
        self.responding = false;
        self.state = SessionState::Closed;

        if requested {
            self.log.system("Disconnected");
        } else if self.failure.is_none() {
            match code {
                Some(code) => self.log.system(format!("Connection closed by server ({code})")),
                None => self.log.system("Connection closed by server"),
            }
        }
    }
}
