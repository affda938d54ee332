//! Single-active-session controller
//!
//! `SessionManager` owns the connection phase, the current turn, the
//! control flags and the transport for at most one live conversation.
//! Start requests are debounced and serialized so only one transport
//! connect is ever in flight; a start against a different scenario fully
//! stops the current session first. Every teardown path (user stop,
//! transport failure, supersession, destroy) funnels through one
//! epoch-guarded transition so a stale connect attempt or a late
//! transport callback can never mutate state that has already moved on.
//!
//! Events fan out synchronously through the [`EventBus`] and are mirrored
//! to a broadcast channel for async consumers (the websocket layer).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colloquy_config::Settings;
use colloquy_core::{
    ConnectionPhase, ErrorKind, ProficiencyLevel, ScenarioId, SessionControlFlags,
    SessionDescriptor, SessionEvent, SessionEventKind, SessionSnapshot, Turn, TurnCompletion,
    UserContext,
};
use colloquy_transport::{
    ClientEvent, NegotiationPhase, SessionPatch, Transport, TransportEvent, TransportFactory,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::{EventBus, Subscription};
use crate::completion::{CompletionDetector, CompletionSignal, FinalizeResult};
use crate::token::{TokenProvider, TokenRequest};

/// Buffer between the transport's callback context and the event pump.
const TRANSPORT_EVENT_BUFFER: usize = 64;

/// Tuning and upstream identity for the manager, usually derived from
/// [`Settings`].
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Window in which rapid start requests are coalesced
    pub start_debounce: Duration,
    /// Bound on how long a turn may sit incomplete after its last signal
    pub completion_fallback: Duration,
    /// Broadcast channel capacity for async event subscribers
    pub event_capacity: usize,
    pub model: String,
    pub voice: String,
    /// Instruction template; `{scenario}` and `{level}` are substituted
    pub instructions_template: String,
}

impl SessionManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            start_debounce: Duration::from_millis(settings.session.start_debounce_ms),
            completion_fallback: Duration::from_millis(settings.session.completion_fallback_ms),
            event_capacity: settings.session.event_capacity,
            model: settings.realtime.model.clone(),
            voice: settings.realtime.voice.clone(),
            instructions_template: settings.realtime.instructions_template.clone(),
        }
    }
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Parameters of one start request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub scenario: ScenarioId,
    pub level: ProficiencyLevel,
    pub user: UserContext,
    pub user_initiated: bool,
}

impl StartRequest {
    pub fn new(scenario: impl Into<ScenarioId>) -> Self {
        Self {
            scenario: scenario.into(),
            level: ProficiencyLevel::default(),
            user: UserContext::default(),
            user_initiated: false,
        }
    }

    pub fn with_level(mut self, level: ProficiencyLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = user;
        self
    }

    pub fn user_initiated(mut self) -> Self {
        self.user_initiated = true;
        self
    }
}

/// Why a teardown is happening; decides which events it emits.
enum TeardownOutcome {
    Stopped { by_user: bool },
    Failed { kind: ErrorKind, message: String },
}

/// Resolution of one establish attempt.
enum StartOutcome {
    Established,
    Failed,
    /// A newer start or a stop invalidated this attempt; the winner owns
    /// all events and cleanup.
    Superseded,
}

struct SessionState {
    phase: ConnectionPhase,
    flags: SessionControlFlags,
    descriptor: Option<SessionDescriptor>,
    detector: CompletionDetector,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            flags: SessionControlFlags::default(),
            descriptor: None,
            detector: CompletionDetector::new(),
        }
    }
}

struct InFlightStart {
    scenario: ScenarioId,
    requested_at: Instant,
}

#[derive(Default)]
struct StartGate {
    in_flight: Option<InFlightStart>,
    /// Most recent coalesced request, run when the in-flight attempt
    /// resolves
    queued: Option<StartRequest>,
}

#[derive(Default)]
struct TaskHandles {
    pump: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

struct Shared {
    config: SessionManagerConfig,
    tokens: Arc<dyn TokenProvider>,
    transports: Arc<dyn TransportFactory>,
    state: Mutex<SessionState>,
    bus: EventBus,
    events_tx: broadcast::Sender<SessionEvent>,
    /// Bumped on every start attempt and teardown. Work tagged with an
    /// older epoch discards itself instead of mutating current state.
    epoch: AtomicU64,
    gate: Mutex<StartGate>,
    turn_notify: Notify,
    transport_slot: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    /// Serializes teardown bodies so their event sequences never
    /// interleave
    teardown_lock: tokio::sync::Mutex<()>,
    /// Serializes start sequences; stop and destroy stay epoch-driven so
    /// they never wait behind a slow connect
    start_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<TaskHandles>,
}

/// Controller for at most one live conversation session.
///
/// Cheap to clone; clones share all state. Long-lived: create once, call
/// [`destroy`](SessionManager::destroy) when the owning surface goes away.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        tokens: Arc<dyn TokenProvider>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                tokens,
                transports,
                state: Mutex::new(SessionState::new()),
                bus: EventBus::new(),
                events_tx,
                epoch: AtomicU64::new(0),
                gate: Mutex::new(StartGate::default()),
                turn_notify: Notify::new(),
                transport_slot: tokio::sync::Mutex::new(None),
                teardown_lock: tokio::sync::Mutex::new(()),
                start_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(TaskHandles::default()),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Start a session, or fold the request into one already running.
    ///
    /// Always resets the control flags first: a start is a clean slate no
    /// matter how the previous session ended. Returns true when the
    /// requested scenario ends up live (including the idempotent
    /// same-scenario case and requests coalesced into a newer start),
    /// false when the attempt failed; failures also surface as an
    /// `error` event, never as a panic or a caller-visible error type.
    pub async fn start_session(&self, request: StartRequest) -> bool {
        self.shared.state.lock().flags.reset();

        tracing::info!(
            scenario = %request.scenario,
            level = %request.level,
            user_initiated = request.user_initiated,
            "Session start requested"
        );

        // Fold into an in-flight start when one exists.
        {
            let mut gate = self.shared.gate.lock();
            if let Some(in_flight) = &gate.in_flight {
                if in_flight.scenario == request.scenario {
                    tracing::debug!(scenario = %request.scenario, "Start coalesced into in-flight attempt");
                    return true;
                }
                // Newest request wins. Within the debounce window the
                // in-flight attempt is abandoned outright; after it, the
                // attempt finishes and is then superseded.
                let in_window = in_flight.requested_at.elapsed() < self.shared.config.start_debounce;
                gate.queued = Some(request);
                if in_window {
                    self.shared.epoch.fetch_add(1, Ordering::SeqCst);
                }
                tracing::debug!(abandoned_in_flight = in_window, "Start queued behind in-flight attempt");
                return true;
            }
        }

        let _serial = self.shared.start_lock.lock().await;
        self.run_start(request).await
    }

    /// Stop the current session and return to idle.
    ///
    /// `by_user` records that the user asked for this stop, which blocks
    /// automatic restarts until the next explicit start. Safe to call
    /// while a connect is in flight; the attempt is abandoned.
    pub async fn stop_session(&self, by_user: bool) {
        if by_user {
            // The intent outlives any race below: even if this stop loses
            // the transition, auto-restart stays blocked.
            self.shared.state.lock().flags.mark_user_ended();
        }
        tracing::info!(by_user, "Session stop requested");

        // An explicit stop outranks any queued start.
        self.shared.gate.lock().queued = None;

        loop {
            let epoch = self.shared.epoch.load(Ordering::SeqCst);
            let idle = self.shared.state.lock().phase == ConnectionPhase::Idle;
            let starting = self.shared.gate.lock().in_flight.is_some();
            if idle && !starting {
                tracing::debug!("Stop requested while idle, nothing to do");
                return;
            }
            if self
                .teardown(epoch, TeardownOutcome::Stopped { by_user })
                .await
            {
                return;
            }
            // Lost the epoch race to another transition; re-check.
            tokio::task::yield_now().await;
        }
    }

    /// Hard reset: abandon any pending connect, release the transport,
    /// drop every event subscription and return to idle without emitting
    /// anything. Never fails; safe from any phase.
    pub async fn destroy(&self) {
        tracing::info!("Destroying session manager state");

        // Invalidate all in-flight work before touching resources, and
        // silence subscribers before any late event could reach them.
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.bus.clear();
        {
            let mut gate = self.shared.gate.lock();
            gate.queued = None;
            gate.in_flight = None;
        }

        // Wait out a teardown already committed, then clean up directly.
        let _guard = self.shared.teardown_lock.lock().await;
        self.abort_tasks();
        {
            let mut slot = self.shared.transport_slot.lock().await;
            if let Some(mut transport) = slot.take() {
                transport.disconnect().await;
            }
        }
        {
            let mut state = self.shared.state.lock();
            state.phase = ConnectionPhase::Idle;
            state.flags.reset();
            state.descriptor = None;
            state.detector.close();
        }
    }

    /// Synchronous read of phase, flags, scenario and current turn.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.state.lock();
        SessionSnapshot {
            phase: state.phase,
            flags: state.flags,
            session_id: state.descriptor.as_ref().map(|d| d.session_id),
            scenario: state.descriptor.as_ref().map(|d| d.scenario.clone()),
            turn: state.detector.current().cloned(),
        }
    }

    /// Register a synchronous event handler.
    pub fn on(
        &self,
        kind: SessionEventKind,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.bus.on(kind, handler)
    }

    /// Remove one handler.
    pub fn off(&self, subscription: &Subscription) {
        self.shared.bus.off(subscription);
    }

    /// Remove every handler for one event kind.
    pub fn off_all(&self, kind: SessionEventKind) {
        self.shared.bus.off_all(kind);
    }

    /// Async event stream; each receiver sees every event from the point
    /// it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Start path
    // ------------------------------------------------------------------

    /// Run start attempts until no newer request is queued. Holds the
    /// start lock.
    async fn run_start(&self, request: StartRequest) -> bool {
        let mut request = request;
        loop {
            // Idempotent same-scenario start: never tear down a live
            // session to rebuild the identical one.
            {
                let state = self.shared.state.lock();
                if state.phase.is_live() {
                    if let Some(descriptor) = &state.descriptor {
                        if descriptor.scenario == request.scenario {
                            tracing::debug!(
                                scenario = %request.scenario,
                                "Scenario already live, start is a no-op"
                            );
                            return true;
                        }
                    }
                }
            }

            // A different scenario is up: fully stop it before starting.
            let current_epoch = self.shared.epoch.load(Ordering::SeqCst);
            if self.shared.state.lock().phase.is_live() {
                self.teardown(current_epoch, TeardownOutcome::Stopped { by_user: false })
                    .await;
            }

            let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.gate.lock().in_flight = Some(InFlightStart {
                scenario: request.scenario.clone(),
                requested_at: Instant::now(),
            });

            let outcome = self.establish(epoch, &request).await;

            let queued = {
                let mut gate = self.shared.gate.lock();
                gate.in_flight = None;
                gate.queued.take()
            };
            match queued {
                Some(next) => {
                    tracing::debug!(scenario = %next.scenario, "Running coalesced start request");
                    request = next;
                }
                None => return matches!(outcome, StartOutcome::Established),
            }
        }
    }

    /// One connect attempt for `epoch`. Emits `connecting`/`connected`
    /// and spawns the per-session tasks on success.
    async fn establish(&self, epoch: u64, request: &StartRequest) -> StartOutcome {
        let shared = &self.shared;
        metrics::counter!("colloquy_session_starts_total").increment(1);

        // Credential first: a session that cannot be authorized never
        // leaves idle.
        let token_request = self.token_request(request);
        let token = match shared.tokens.request_token(&token_request).await {
            Ok(token) => token,
            Err(error) => {
                if shared.epoch.load(Ordering::SeqCst) != epoch {
                    return StartOutcome::Superseded;
                }
                tracing::warn!(%error, "Token request failed");
                metrics::counter!(
                    "colloquy_session_failures_total",
                    "kind" => ErrorKind::TokenFailed.as_str()
                )
                .increment(1);
                self.emit(SessionEvent::Error {
                    kind: ErrorKind::TokenFailed,
                    message: error.to_string(),
                });
                return StartOutcome::Failed;
            }
        };

        // Commit: the session becomes visible as connecting. Epoch is
        // re-validated under the state lock so a stop that already won
        // suppresses the transition entirely.
        {
            let mut state = shared.state.lock();
            if shared.epoch.load(Ordering::SeqCst) != epoch {
                return StartOutcome::Superseded;
            }
            state.descriptor = Some(SessionDescriptor::new(
                request.scenario.clone(),
                request.level,
                request.user.clone(),
            ));
            state.phase = ConnectionPhase::Connecting;
        }
        self.emit(SessionEvent::StateChanged {
            from: ConnectionPhase::Idle,
            to: ConnectionPhase::Connecting,
        });
        self.emit(SessionEvent::Connecting {
            scenario: request.scenario.clone(),
        });
        tracing::info!(scenario = %request.scenario, "Connecting transport");

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(TRANSPORT_EVENT_BUFFER);
        let mut transport = shared.transports.create();
        transport.set_event_sink(event_tx);

        if let Err(error) = transport.connect(&token.token).await {
            transport.disconnect().await;
            if shared.epoch.load(Ordering::SeqCst) != epoch {
                return StartOutcome::Superseded;
            }
            let kind = match error.phase() {
                Some(NegotiationPhase::Ice) => ErrorKind::IceFailed,
                _ => ErrorKind::ConnectionFailed,
            };
            tracing::warn!(%error, kind = %kind, "Transport connect failed");
            self.teardown(
                epoch,
                TeardownOutcome::Failed {
                    kind,
                    message: error.to_string(),
                },
            )
            .await;
            return StartOutcome::Failed;
        }

        // Park the transport, then re-check: a teardown that won while we
        // were negotiating finds the slot and releases it; one that won
        // before the store is handled by taking it right back out.
        *shared.transport_slot.lock().await = Some(transport);
        if shared.epoch.load(Ordering::SeqCst) != epoch {
            if let Some(mut stale) = shared.transport_slot.lock().await.take() {
                stale.disconnect().await;
            }
            return StartOutcome::Superseded;
        }

        self.transition(ConnectionPhase::Connected);
        self.emit(SessionEvent::Connected {
            scenario: request.scenario.clone(),
        });
        tracing::info!(scenario = %request.scenario, "Session connected");

        // Push the per-scenario instructions over the control channel; the
        // credential alone does not carry them to the live session.
        {
            let slot = shared.transport_slot.lock().await;
            if let Some(transport) = slot.as_ref() {
                transport.send(&ClientEvent::SessionUpdate {
                    session: SessionPatch {
                        instructions: Some(token_request.instructions.clone()),
                        voice: Some(shared.config.voice.clone()),
                    },
                });
            }
        }

        self.spawn_event_pump(epoch, event_rx);
        self.spawn_turn_watchdog(epoch);
        StartOutcome::Established
    }

    fn token_request(&self, request: &StartRequest) -> TokenRequest {
        let config = &self.shared.config;
        TokenRequest {
            model: config.model.clone(),
            voice: config.voice.clone(),
            instructions: render_instructions(
                &config.instructions_template,
                &request.scenario,
                request.level,
            ),
            scenario_id: Some(request.scenario.clone()),
            level: Some(request.level),
            user: Some(request.user.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Teardown path
    // ------------------------------------------------------------------

    /// The single transition out of a live session.
    ///
    /// Wins or loses atomically on the epoch: exactly one caller per
    /// epoch performs teardown, everyone else no-ops. The winner emits
    /// the full event sequence ending in `sessionStopped`, guaranteed to
    /// be the last event before idle.
    async fn teardown(&self, expected_epoch: u64, outcome: TeardownOutcome) -> bool {
        let shared = &self.shared;
        let _guard = shared.teardown_lock.lock().await;
        if shared
            .epoch
            .compare_exchange(
                expected_epoch,
                expected_epoch + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        // Nothing ran yet for this epoch (stop during the token fetch):
        // the won epoch is enough to make the starter unwind silently.
        if shared.state.lock().phase == ConnectionPhase::Idle {
            return true;
        }

        // Background tasks belong to the epoch being retired.
        self.abort_tasks();

        match &outcome {
            TeardownOutcome::Failed { kind, message } => {
                tracing::warn!(kind = %kind, %message, "Session failed");
                metrics::counter!(
                    "colloquy_session_failures_total",
                    "kind" => kind.as_str()
                )
                .increment(1);
                self.transition(ConnectionPhase::Failed);
                self.emit(SessionEvent::Error {
                    kind: *kind,
                    message: message.clone(),
                });
            }
            TeardownOutcome::Stopped { .. } => {
                self.transition(ConnectionPhase::Closing);
            }
        }

        // Release the transport (and with it the microphone) while the
        // phase still shows teardown in progress. A response still
        // streaming is cancelled first so the upstream stops producing
        // audio for a session nobody is listening to.
        let open_turn = shared
            .state
            .lock()
            .detector
            .current()
            .map(|turn| !turn.is_complete())
            .unwrap_or(false);
        {
            let mut slot = shared.transport_slot.lock().await;
            if let Some(mut transport) = slot.take() {
                if open_turn {
                    transport.send(&ClientEvent::ResponseCancel);
                }
                transport.disconnect().await;
            }
        }

        // Never drop a turn silently: an open turn gets its final
        // speechEnded before the session closes.
        let closed_turn = {
            let mut state = shared.state.lock();
            state.detector.close()
        };
        if let Some(turn) = closed_turn {
            self.finish_turn(turn);
        }

        let (session_id, by_user) = {
            let mut state = shared.state.lock();
            let id = state.descriptor.as_ref().map(|d| d.session_id);
            state.descriptor = None;
            (id, matches!(outcome, TeardownOutcome::Stopped { by_user: true }))
        };

        self.transition(ConnectionPhase::Idle);
        self.emit(SessionEvent::SessionStopped {
            session_id,
            by_user,
        });
        metrics::counter!("colloquy_session_stops_total").increment(1);
        tracing::info!(by_user, "Session stopped");
        true
    }

    fn abort_tasks(&self) {
        let mut tasks = self.shared.tasks.lock();
        if let Some(pump) = tasks.pump.take() {
            pump.abort();
        }
        if let Some(watchdog) = tasks.watchdog.take() {
            watchdog.abort();
        }
    }

    // ------------------------------------------------------------------
    // Per-session tasks
    // ------------------------------------------------------------------

    /// Drain transport events into state updates and domain events until
    /// the session's epoch is retired or the transport reports a fatal
    /// disconnect.
    fn spawn_event_pump(&self, epoch: u64, mut events: mpsc::Receiver<TransportEvent>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if manager.shared.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                if manager.handle_transport_event(epoch, event) {
                    break;
                }
            }
            tracing::debug!(epoch, "Event pump finished");
        });
        self.shared.tasks.lock().pump = Some(handle);
    }

    /// Returns true when pumping must stop (fatal transport event).
    fn handle_transport_event(&self, epoch: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::SessionReady => {
                self.transition(ConnectionPhase::Active);
                false
            }
            TransportEvent::ResponseStarted { response_id } => {
                let superseded = {
                    let mut state = self.shared.state.lock();
                    state.detector.begin_turn(response_id.clone())
                };
                if let Some(turn) = superseded {
                    tracing::warn!(
                        response_id = %turn.response_id,
                        "Previous turn superseded before completing"
                    );
                    self.finish_turn(turn);
                }
                self.shared.turn_notify.notify_one();
                self.emit(SessionEvent::SpeechStarted { response_id });
                false
            }
            TransportEvent::AudioStarted { response_id } => {
                {
                    let mut state = self.shared.state.lock();
                    state.detector.note_audio_started(response_id.as_deref());
                }
                self.shared.turn_notify.notify_one();
                false
            }
            TransportEvent::AudioEnded { response_id } => {
                self.apply_signal(CompletionSignal::AudioEnded, response_id.as_deref());
                false
            }
            TransportEvent::TranscriptDelta { response_id, delta } => {
                let accepted = {
                    let mut state = self.shared.state.lock();
                    state.detector.push_delta(&response_id, &delta)
                };
                if accepted {
                    self.shared.turn_notify.notify_one();
                    self.emit(SessionEvent::TranscriptDelta { response_id, delta });
                }
                false
            }
            TransportEvent::TranscriptFinal { response_id, text } => {
                let result = {
                    let mut state = self.shared.state.lock();
                    state.detector.finalize_transcript(&response_id, text.clone())
                };
                self.shared.turn_notify.notify_one();
                match result {
                    FinalizeResult::Finalized => {
                        self.emit(SessionEvent::TranscriptComplete {
                            response_id,
                            transcript: text,
                        });
                    }
                    FinalizeResult::FinalizedAndCompleted(turn) => {
                        self.emit(SessionEvent::TranscriptComplete {
                            response_id,
                            transcript: text,
                        });
                        self.finish_turn(turn);
                    }
                    FinalizeResult::Stale => {
                        tracing::debug!(%response_id, "Ignoring transcript for stale turn");
                    }
                }
                false
            }
            TransportEvent::ResponseComplete { response_id } => {
                self.apply_signal(CompletionSignal::UpstreamCompleted, Some(&response_id));
                false
            }
            TransportEvent::UpstreamError { code, message } => {
                // Upstream errors are per-response and recoverable; the
                // session stays up unless the transport itself fails.
                tracing::warn!(?code, %message, "Upstream reported an error");
                false
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!(?state, "Transport state changed");
                false
            }
            TransportEvent::Disconnected { reason } => {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager
                        .teardown(
                            epoch,
                            TeardownOutcome::Failed {
                                kind: ErrorKind::ConnectionFailed,
                                message: reason,
                            },
                        )
                        .await;
                });
                true
            }
        }
    }

    fn apply_signal(&self, signal: CompletionSignal, response_id: Option<&str>) {
        let completed = {
            let mut state = self.shared.state.lock();
            state.detector.apply(signal, response_id)
        };
        self.shared.turn_notify.notify_one();
        if let Some(turn) = completed {
            self.finish_turn(turn);
        }
    }

    /// Watch the current turn's fallback deadline. Signals re-arm the
    /// timer via `turn_notify`; if a turn sits incomplete past the window
    /// it is forced closed with a diagnostic, so the UI never hangs on a
    /// stuck turn. A fallback is a health signal, not an error.
    fn spawn_turn_watchdog(&self, epoch: u64) {
        let manager = self.clone();
        let window = manager.shared.config.completion_fallback;
        let handle = tokio::spawn(async move {
            loop {
                if manager.shared.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                let deadline = manager.shared.state.lock().detector.deadline(window);
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {
                                let expired = {
                                    let mut state = manager.shared.state.lock();
                                    state.detector.force_fallback()
                                };
                                if let Some(turn) = expired {
                                    tracing::warn!(
                                        response_id = %turn.response_id,
                                        window_secs = window.as_secs(),
                                        "Turn completion fallback fired"
                                    );
                                    manager.finish_turn(turn);
                                }
                            }
                            _ = manager.shared.turn_notify.notified() => {}
                        }
                    }
                    None => manager.shared.turn_notify.notified().await,
                }
            }
            tracing::debug!(epoch, "Turn watchdog finished");
        });
        self.shared.tasks.lock().watchdog = Some(handle);
    }

    // ------------------------------------------------------------------
    // Event plumbing
    // ------------------------------------------------------------------

    /// Move to `to` if the transition map allows it, emitting
    /// `stateChanged`. Disallowed transitions are logged and skipped,
    /// which makes the teardown walk safe to run from any live phase.
    fn transition(&self, to: ConnectionPhase) {
        let from = {
            let mut state = self.shared.state.lock();
            let from = state.phase;
            if from == to {
                return;
            }
            if !from.can_transition_to(to) {
                tracing::warn!(%from, %to, "Skipping disallowed phase transition");
                return;
            }
            state.phase = to;
            from
        };
        tracing::info!(%from, %to, "Session phase changed");
        self.emit(SessionEvent::StateChanged { from, to });
    }

    /// Emit the event that closes out a finished turn.
    fn finish_turn(&self, turn: Turn) {
        let completion = turn.completion.unwrap_or(TurnCompletion::Signals);
        metrics::counter!(
            "colloquy_turns_completed_total",
            "completion" => completion.as_str()
        )
        .increment(1);
        self.emit(SessionEvent::SpeechEnded {
            response_id: turn.response_id,
            transcript: turn.transcript,
            completion,
        });
    }

    /// Fan out synchronously to bus handlers, then mirror to the
    /// broadcast channel.
    fn emit(&self, event: SessionEvent) {
        tracing::debug!(event = %event.kind(), "Emitting session event");
        self.shared.bus.emit(&event);
        let _ = self.shared.events_tx.send(event);
    }
}

fn render_instructions(template: &str, scenario: &ScenarioId, level: ProficiencyLevel) -> String {
    template
        .replace("{scenario}", scenario.as_str())
        .replace("{level}", level.as_str())
}
