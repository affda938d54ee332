//! Wire schema for the upstream data channel
//!
//! JSON messages exchanged on the "oai-events" channel. Only the
//! variants the session machine consumes are modeled; everything else
//! deserializes to [`ServerEvent::Unknown`] and is ignored, so new
//! upstream message types never break parsing.

use serde::{Deserialize, Serialize};

use crate::traits::TransportEvent;

/// Inbound message from the upstream API
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseRef },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { response_id: String, delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        response_id: String,
        transcript: String,
    },

    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseRef },

    #[serde(rename = "output_audio_buffer.started")]
    OutputAudioStarted {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "output_audio_buffer.stopped")]
    OutputAudioStopped {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    InputSpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    InputSpeechStopped,

    #[serde(rename = "error")]
    Error { error: ErrorBody },

    #[serde(other)]
    Unknown,
}

/// Reference to a response object in upstream payloads
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseRef {
    pub id: String,
}

/// Error payload carried by upstream `error` events
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub message: String,
}

impl ServerEvent {
    /// Map a wire message to the transport event the session consumes.
    /// Returns `None` for messages the session has no use for.
    pub fn into_transport_event(self) -> Option<TransportEvent> {
        match self {
            Self::SessionCreated => Some(TransportEvent::SessionReady),
            Self::ResponseCreated { response } => Some(TransportEvent::ResponseStarted {
                response_id: response.id,
            }),
            Self::AudioTranscriptDelta { response_id, delta } => {
                Some(TransportEvent::TranscriptDelta { response_id, delta })
            }
            Self::AudioTranscriptDone {
                response_id,
                transcript,
            } => Some(TransportEvent::TranscriptFinal {
                response_id,
                text: transcript,
            }),
            Self::ResponseDone { response } => Some(TransportEvent::ResponseComplete {
                response_id: response.id,
            }),
            Self::OutputAudioStarted { response_id } => {
                Some(TransportEvent::AudioStarted { response_id })
            }
            Self::OutputAudioStopped { response_id } => {
                Some(TransportEvent::AudioEnded { response_id })
            }
            Self::Error { error } => Some(TransportEvent::UpstreamError {
                code: error.code,
                message: error.message,
            }),
            // User speech markers and session.updated acks carry nothing
            // the turn machinery needs.
            Self::SessionUpdated | Self::InputSpeechStarted | Self::InputSpeechStopped => None,
            Self::Unknown => None,
        }
    }
}

/// Outbound control message to the upstream API
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionPatch },

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

/// Partial session settings for `session.update`
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}
