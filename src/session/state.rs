use std::fmt;

use url::Url;

use crate::protocol::{ConfigEcho, SessionConfig};

/// Lifecycle of a [`super::VoiceSession`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    /// Handshake in flight or streaming connection not yet open
    Connecting,
    Active,
    /// Close requested, waiting for the peer
    Closing,
    /// Terminal for the current session; `connect` starts a new one
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Check if a new `connect` is allowed
    #[must_use]
    pub const fn can_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session provisioned by the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Server-issued identifier
    pub id: String,
    /// Config as requested, mirrored locally after updates
    pub config: SessionConfig,
    /// Config as last echoed by the server, for display
    pub echoed: ConfigEcho,
    /// Streaming endpoint the connection was opened on
    pub endpoint: Url,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_allowed_from_rest_states_only() {
        assert!(SessionState::Idle.can_connect());
        assert!(SessionState::Closed.can_connect());
        assert!(!SessionState::Connecting.can_connect());
        assert!(!SessionState::Active.can_connect());
        assert!(!SessionState::Closing.can_connect());
    }
}
