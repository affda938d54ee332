//! Scripted doubles for exercising the session machine without a network
//!
//! `ScriptedTransportFactory` hands out transports whose connect behavior
//! is queued up front (succeed, fail at a named phase, or stall), counts
//! connects/disconnects, and tracks a simulated microphone so tests can
//! assert the device is released on every exit path. Events are injected
//! through the sink handle of the most recently created transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colloquy_transport::{
    ClientEvent, NegotiationPhase, Transport, TransportError, TransportEvent, TransportFactory,
    TransportState, TransportStats,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::token::{RealtimeToken, TokenError, TokenProvider, TokenRequest};

/// Behavior of one scripted connect attempt. The default succeeds
/// immediately.
#[derive(Debug, Default)]
pub struct ConnectScript {
    /// Sleep this long before resolving, to hold a connect in flight
    pub delay: Option<Duration>,
    /// Fail at this negotiation phase instead of connecting
    pub fail: Option<(NegotiationPhase, String)>,
}

#[derive(Default)]
struct FactoryInner {
    scripts: Mutex<VecDeque<ConnectScript>>,
    sinks: Mutex<Vec<SinkSlot>>,
    sent: Arc<Mutex<Vec<ClientEvent>>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    mic_active: AtomicUsize,
}

type SinkSlot = Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>;

/// Factory side of the double; clone-free, share via `Arc`.
#[derive(Default)]
pub struct ScriptedTransportFactory {
    inner: Arc<FactoryInner>,
}

impl ScriptedTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failing connect for the next created transport.
    pub fn script_failure(&self, phase: NegotiationPhase, message: impl Into<String>) {
        self.inner.scripts.lock().push_back(ConnectScript {
            delay: None,
            fail: Some((phase, message.into())),
        });
    }

    /// Queue a connect that stalls for `delay` before succeeding.
    pub fn script_delay(&self, delay: Duration) {
        self.inner.scripts.lock().push_back(ConnectScript {
            delay: Some(delay),
            fail: None,
        });
    }

    /// Connect attempts observed so far.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Disconnects that actually closed a transport (idempotent repeats
    /// are not counted).
    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// Simulated microphone captures currently held.
    pub fn mic_active(&self) -> usize {
        self.inner.mic_active.load(Ordering::SeqCst)
    }

    /// Control messages any of this factory's transports were asked to
    /// send while connected.
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.inner.sent.lock().clone()
    }

    /// Inject an upstream event through the most recent transport's sink.
    /// Returns false if no transport exists or its sink is gone.
    pub async fn push(&self, event: TransportEvent) -> bool {
        let sink = {
            let sinks = self.inner.sinks.lock();
            sinks.last().and_then(|slot| slot.lock().clone())
        };
        match sink {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        let sink: SinkSlot = Arc::new(Mutex::new(None));
        self.inner.sinks.lock().push(Arc::clone(&sink));
        Box::new(ScriptedTransport {
            factory: Arc::clone(&self.inner),
            sink,
            state: TransportState::New,
            holds_mic: false,
            sent: Arc::clone(&self.inner.sent),
        })
    }
}

/// Transport double created by [`ScriptedTransportFactory`].
pub struct ScriptedTransport {
    factory: Arc<FactoryInner>,
    sink: SinkSlot,
    state: TransportState,
    holds_mic: bool,
    sent: Arc<Mutex<Vec<ClientEvent>>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, _token: &str) -> Result<(), TransportError> {
        if self.state == TransportState::Connected {
            return Err(TransportError::AlreadyConnected);
        }
        self.state = TransportState::Connecting;
        self.factory.connects.fetch_add(1, Ordering::SeqCst);

        let script = self.factory.scripts.lock().pop_front().unwrap_or_default();
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((phase, message)) = script.fail {
            self.state = TransportState::Failed;
            return Err(TransportError::negotiation(phase, message));
        }

        self.factory.mic_active.fetch_add(1, Ordering::SeqCst);
        self.holds_mic = true;
        self.state = TransportState::Connected;
        Ok(())
    }

    fn send(&self, event: &ClientEvent) {
        if self.state == TransportState::Connected {
            self.sent.lock().push(event.clone());
        }
    }

    fn set_event_sink(&mut self, sink: mpsc::Sender<TransportEvent>) {
        *self.sink.lock() = Some(sink);
    }

    async fn disconnect(&mut self) {
        *self.sink.lock() = None;
        if self.holds_mic {
            self.holds_mic = false;
            self.factory.mic_active.fetch_sub(1, Ordering::SeqCst);
        }
        if self.state != TransportState::Closed {
            if self.state == TransportState::Connected {
                self.factory.disconnects.fetch_add(1, Ordering::SeqCst);
            }
            self.state = TransportState::Closed;
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Token provider whose failures are queued up front; requests succeed
/// with a fixed token once the queue is drained.
pub struct ScriptedTokenProvider {
    token: String,
    fail_next: Mutex<VecDeque<(u16, String)>>,
    requests: AtomicUsize,
}

impl ScriptedTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            fail_next: Mutex::new(VecDeque::new()),
            requests: AtomicUsize::new(0),
        }
    }

    /// Queue one failed mint with the given HTTP status.
    pub fn script_failure(&self, status: u16, body: impl Into<String>) {
        self.fail_next.lock().push_back((status, body.into()));
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for ScriptedTokenProvider {
    async fn request_token(&self, _request: &TokenRequest) -> Result<RealtimeToken, TokenError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some((status, body)) = self.fail_next.lock().pop_front() {
            return Err(TokenError::Status { status, body });
        }
        Ok(RealtimeToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let factory = ScriptedTransportFactory::new();
        factory.script_failure(NegotiationPhase::Ice, "no candidates");

        let mut first = factory.create();
        let err = first.connect("tok").await.unwrap_err();
        assert_eq!(err.phase(), Some(NegotiationPhase::Ice));
        assert_eq!(factory.mic_active(), 0);

        let mut second = factory.create();
        second.connect("tok").await.unwrap();
        assert_eq!(factory.mic_active(), 1);
        assert_eq!(factory.connects(), 2);

        second.disconnect().await;
        second.disconnect().await;
        assert_eq!(factory.mic_active(), 0);
        assert_eq!(factory.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_push_reaches_registered_sink() {
        let factory = ScriptedTransportFactory::new();
        let mut transport = factory.create();

        let (tx, mut rx) = mpsc::channel(8);
        transport.set_event_sink(tx);
        transport.connect("tok").await.unwrap();

        assert!(factory.push(TransportEvent::SessionReady).await);
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::SessionReady)
        ));

        transport.disconnect().await;
        assert!(!factory.push(TransportEvent::SessionReady).await);
    }
}
