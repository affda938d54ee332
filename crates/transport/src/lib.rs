//! Transport layer for the realtime conversation session manager
//!
//! Owns the peer connection, the local microphone track, and the JSON
//! data channel to the upstream speech API. The session crate drives
//! this layer exclusively through the [`Transport`] and
//! [`TransportFactory`] traits, so tests can swap in a scripted fake.

pub mod mic;
pub mod protocol;
pub mod traits;
pub mod webrtc;

use std::fmt;

use thiserror::Error;

pub use mic::{MicCapture, MicError, MicFrame, MicrophoneSource, SilenceMicSource};
pub use protocol::{ClientEvent, ServerEvent, SessionPatch};
pub use traits::{Transport, TransportEvent, TransportFactory, TransportStats};
pub use webrtc::{IceServer, RealtimeTransport, RealtimeTransportConfig, RealtimeTransportFactory};

/// Negotiation step that failed during connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Media engine setup or track attachment
    Media,
    /// Local offer creation
    Offer,
    /// ICE gathering or connectivity
    Ice,
    /// Posting the offer to the upstream endpoint
    SdpExchange,
    /// Applying the remote answer
    Answer,
    /// Waiting for the data channel to open
    DataChannel,
}

impl NegotiationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Media => "media",
            Self::Offer => "offer",
            Self::Ice => "ice",
            Self::SdpExchange => "sdp_exchange",
            Self::Answer => "answer",
            Self::DataChannel => "data_channel",
        }
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Negotiation failed at {phase}: {message}")]
    Negotiation {
        phase: NegotiationPhase,
        message: String,
    },

    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Microphone error: {0}")]
    Mic(#[from] MicError),
}

impl TransportError {
    pub fn negotiation(phase: NegotiationPhase, message: impl Into<String>) -> Self {
        Self::Negotiation {
            phase,
            message: message.into(),
        }
    }

    /// Negotiation step the error occurred in, if any
    pub fn phase(&self) -> Option<NegotiationPhase> {
        match self {
            Self::Negotiation { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Connection state of a transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// Fresh instance, connect not yet called
    #[default]
    New,
    /// Negotiation in progress
    Connecting,
    /// Peer connection and data channel are up
    Connected,
    /// Peer connection lost; may still recover at the ICE layer
    Disconnected,
    /// Peer connection unrecoverable
    Failed,
    /// Closed by disconnect
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(NegotiationPhase::Ice.as_str(), "ice");
        assert_eq!(NegotiationPhase::SdpExchange.as_str(), "sdp_exchange");
    }

    #[test]
    fn test_error_phase_accessor() {
        let err = TransportError::negotiation(NegotiationPhase::DataChannel, "timed out");
        assert_eq!(err.phase(), Some(NegotiationPhase::DataChannel));

        let err = TransportError::Mic(MicError::Unavailable("no device".into()));
        assert_eq!(err.phase(), None);
    }
}
