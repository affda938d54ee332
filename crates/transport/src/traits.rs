//! Transport abstraction boundary
//!
//! The session state machine only ever sees these traits. The WebRTC
//! implementation lives in [`crate::webrtc`]; tests drive the machine
//! with scripted fakes instead.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::ClientEvent;
use crate::{TransportError, TransportState};

/// Events a transport delivers to its single registered sink
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Upstream acknowledged the session on the data channel
    SessionReady,
    /// Upstream began producing a response
    ResponseStarted { response_id: String },
    /// Assistant audio playback started
    AudioStarted { response_id: Option<String> },
    /// Assistant audio playback ended
    AudioEnded { response_id: Option<String> },
    /// Incremental transcript text for a response
    TranscriptDelta { response_id: String, delta: String },
    /// Upstream marked the transcript final
    TranscriptFinal { response_id: String, text: String },
    /// Upstream reported the response fully complete
    ResponseComplete { response_id: String },
    /// Error reported by the upstream API on the data channel
    UpstreamError {
        code: Option<String>,
        message: String,
    },
    /// Peer connection state moved
    StateChanged(TransportState),
    /// Connection lost; the session cannot continue on this transport
    Disconnected { reason: String },
}

/// Counters kept by a transport instance
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub audio_frames_sent: u64,
}

/// A single-use connection to the upstream speech API
///
/// Instances are one-shot: `connect` may be called at most once, and a
/// factory hands out a fresh transport for every attempt. Setting the
/// event sink replaces any previous sink; there is never more than one.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Negotiate the connection using a short-lived credential.
    async fn connect(&mut self, token: &str) -> Result<(), TransportError>;

    /// Enqueue a control message on the data channel. Dropped with a
    /// warning when the channel is not open; callers check phase first.
    fn send(&self, event: &ClientEvent);

    /// Register the sink that receives transport events.
    fn set_event_sink(&mut self, sink: mpsc::Sender<TransportEvent>);

    /// Tear down the connection and release the microphone. Idempotent;
    /// calling it on a never-connected transport is a no-op.
    async fn disconnect(&mut self);

    fn state(&self) -> TransportState;

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    fn stats(&self) -> TransportStats;
}

/// Creates fresh transports, one per connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}
