//! WebRTC transport implementation
//!
//! Negotiates a peer connection with the upstream realtime speech API:
//! publishes the local microphone as an Opus track, opens the
//! "oai-events" data channel for JSON control traffic, and exchanges
//! SDP over HTTPS (offer posted with a short-lived bearer token, answer
//! returned in the response body).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use audiopus::coder::Encoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};

use colloquy_config::Settings;

use crate::mic::MicrophoneSource;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::traits::{Transport, TransportEvent, TransportFactory, TransportStats};
use crate::{NegotiationPhase, TransportError, TransportState};

/// Largest encoded Opus frame we ever produce
const MAX_OPUS_FRAME_BYTES: usize = 4000;

type EventSink = Arc<RwLock<Option<mpsc::Sender<TransportEvent>>>>;

/// ICE server configuration
#[derive(Debug, Clone)]
pub struct IceServer {
    /// Server URLs (stun: or turn:)
    pub urls: Vec<String>,
    /// Username (for TURN)
    pub username: Option<String>,
    /// Credential (for TURN)
    pub credential: Option<String>,
}

impl Default for IceServer {
    fn default() -> Self {
        Self {
            urls: vec![colloquy_config::constants::webrtc::DEFAULT_STUN_URL.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Everything a transport needs to reach the upstream API
#[derive(Debug, Clone)]
pub struct RealtimeTransportConfig {
    /// Endpoint the SDP offer is posted to
    pub realtime_url: String,
    /// Model appended as a query parameter on the SDP exchange
    pub model: String,
    /// ICE servers
    pub ice_servers: Vec<IceServer>,
    /// End-to-end connect timeout
    pub connect_timeout: Duration,
    /// Data channel label
    pub data_channel_label: String,
    /// Microphone capture sample rate (Hz)
    pub mic_sample_rate_hz: u32,
    /// Frame duration per encoded packet (ms)
    pub mic_frame_ms: u32,
    /// Opus target bitrate (bits/s)
    pub opus_bitrate: i32,
}

impl RealtimeTransportConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            realtime_url: settings.realtime.base_url.clone(),
            model: settings.realtime.model.clone(),
            ice_servers: settings
                .transport
                .ice_servers
                .iter()
                .map(|s| IceServer {
                    urls: s.urls.clone(),
                    username: (!s.username.is_empty()).then(|| s.username.clone()),
                    credential: (!s.credential.is_empty()).then(|| s.credential.clone()),
                })
                .collect(),
            connect_timeout: Duration::from_secs(settings.transport.connect_timeout_secs),
            data_channel_label: settings.transport.data_channel_label.clone(),
            mic_sample_rate_hz: settings.transport.mic_sample_rate_hz,
            mic_frame_ms: settings.transport.mic_frame_ms,
            opus_bitrate: settings.transport.opus_bitrate,
        }
    }
}

impl Default for RealtimeTransportConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Default)]
struct StatsInner {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    audio_frames_sent: AtomicU64,
}

/// WebRTC transport to the upstream realtime speech API
///
/// One-shot: a factory creates a fresh instance per connection attempt.
pub struct RealtimeTransport {
    config: RealtimeTransportConfig,
    mic: Arc<dyn MicrophoneSource>,
    http: reqwest::Client,
    state: Arc<RwLock<TransportState>>,
    event_tx: EventSink,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    outbound_tx: Option<mpsc::UnboundedSender<String>>,
    dc_open: Arc<AtomicBool>,
    mic_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    stats: Arc<StatsInner>,
}

impl RealtimeTransport {
    pub fn new(config: RealtimeTransportConfig, mic: Arc<dyn MicrophoneSource>) -> Self {
        Self {
            config,
            mic,
            http: reqwest::Client::new(),
            state: Arc::new(RwLock::new(TransportState::New)),
            event_tx: Arc::new(RwLock::new(None)),
            peer_connection: None,
            outbound_tx: None,
            dc_open: Arc::new(AtomicBool::new(false)),
            mic_task: None,
            writer_task: None,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Create WebRTC API with media engine
    fn create_api(&self) -> Result<API, TransportError> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    stats_id: String::new(),
                },
                webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio,
            )
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Media, e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Media, e.to_string()))?;

        let mut setting_engine = SettingEngine::default();

        use colloquy_config::constants::webrtc::{
            ICE_DISCONNECTED_TIMEOUT_SECS, ICE_FAILED_TIMEOUT_SECS, ICE_KEEPALIVE_INTERVAL_SECS,
        };

        // Configure ICE timeouts for better NAT traversal
        setting_engine.set_ice_timeouts(
            Some(Duration::from_secs(ICE_DISCONNECTED_TIMEOUT_SECS)),
            Some(Duration::from_secs(ICE_FAILED_TIMEOUT_SECS)),
            Some(Duration::from_secs(ICE_KEEPALIVE_INTERVAL_SECS)),
        );

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    /// Create RTCConfiguration from config
    fn create_rtc_config(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// Post the local offer to the upstream endpoint, returning the
    /// answer SDP from the response body.
    async fn exchange_sdp(&self, token: &str, offer_sdp: String) -> Result<String, TransportError> {
        let url = format!("{}?model={}", self.config.realtime_url, self.config.model);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/sdp")
            .body(offer_sdp)
            .timeout(self.config.connect_timeout)
            .send()
            .await
            .map_err(|e| {
                TransportError::negotiation(NegotiationPhase::SdpExchange, e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::negotiation(
                NegotiationPhase::SdpExchange,
                format!("upstream returned {}: {}", status, body),
            ));
        }

        response.text().await.map_err(|e| {
            TransportError::negotiation(NegotiationPhase::SdpExchange, e.to_string())
        })
    }

    /// Encode mic frames to Opus and write them to the local track
    /// until the capture ends or the task is aborted. Dropping the
    /// capture releases the device.
    fn spawn_mic_pump(
        &self,
        mut capture: Box<dyn crate::mic::MicCapture>,
        mut encoder: Encoder,
        track: Arc<TrackLocalStaticSample>,
    ) -> JoinHandle<()> {
        let samples_per_frame =
            (self.config.mic_sample_rate_hz * self.config.mic_frame_ms / 1000) as usize;
        let frame_duration = Duration::from_millis(self.config.mic_frame_ms as u64);
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_OPUS_FRAME_BYTES];

            while let Some(frame) = capture.next_frame().await {
                if frame.samples.len() != samples_per_frame {
                    tracing::warn!(
                        got = frame.samples.len(),
                        want = samples_per_frame,
                        "Skipping short mic frame"
                    );
                    continue;
                }

                let encoded = match encoder.encode(&frame.samples, &mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "Opus encode failed");
                        continue;
                    }
                };

                let sample = Sample {
                    data: Bytes::copy_from_slice(&buf[..encoded]),
                    duration: frame_duration,
                    ..Default::default()
                };

                if track.write_sample(&sample).await.is_err() {
                    break;
                }
                stats.audio_frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        })
    }
}

/// Deliver an event to the registered sink, if one is set
async fn deliver(sink: &EventSink, event: TransportEvent) {
    let tx = sink.read().clone();
    if let Some(tx) = tx {
        let _ = tx.send(event).await;
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        // RFC 7587: the rtpmap always says 2 channels even for mono payloads
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

#[async_trait]
impl Transport for RealtimeTransport {
    async fn connect(&mut self, token: &str) -> Result<(), TransportError> {
        if self.peer_connection.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        *self.state.write() = TransportState::Connecting;

        // Create the Opus encoder up front so a bad audio config fails
        // before any network work happens.
        let sample_rate = SampleRate::try_from(self.config.mic_sample_rate_hz as i32)
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Media, e.to_string()))?;
        let mut encoder = Encoder::new(sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Media, e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(self.config.opus_bitrate))
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Media, e.to_string()))?;

        let api = self.create_api()?;
        let rtc_config = self.create_rtc_config();
        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Media, e.to_string()))?;

        let pc = Arc::new(peer_connection);
        self.peer_connection = Some(pc.clone());

        // Surface connectivity loss both as events for the session pump
        // and as a oneshot so connect itself can fail on early ICE death.
        let (failed_tx, failed_rx) = oneshot::channel::<()>();
        let failed_tx = Arc::new(Mutex::new(Some(failed_tx)));

        let state_ref = self.state.clone();
        let sink = self.event_tx.clone();

        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let next = match s {
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
                _ => return Box::pin(async {}),
            };

            *state_ref.write() = next;

            if next == TransportState::Failed {
                if let Some(tx) = failed_tx.lock().take() {
                    let _ = tx.send(());
                }
            }

            let sink = sink.clone();
            Box::pin(async move {
                deliver(&sink, TransportEvent::StateChanged(next)).await;
                if matches!(next, TransportState::Disconnected | TransportState::Failed) {
                    deliver(
                        &sink,
                        TransportEvent::Disconnected {
                            reason: format!("peer connection {:?}", next),
                        },
                    )
                    .await;
                }
            })
        }));

        // Local mic track
        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            "colloquy-mic".to_string(),
        ));
        pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Media, e.to_string()))?;

        // Data channel must exist before the offer so it lands in the SDP
        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(&self.config.data_channel_label, Some(dc_init))
            .await
            .map_err(|e| {
                TransportError::negotiation(NegotiationPhase::DataChannel, e.to_string())
            })?;

        let (open_tx, open_rx) = oneshot::channel::<()>();
        let open_tx = Arc::new(Mutex::new(Some(open_tx)));
        let dc_open = self.dc_open.clone();
        dc.on_open(Box::new(move || {
            dc_open.store(true, Ordering::Release);
            if let Some(tx) = open_tx.lock().take() {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));

        let dc_open = self.dc_open.clone();
        dc.on_close(Box::new(move || {
            dc_open.store(false, Ordering::Release);
            Box::pin(async {})
        }));

        let sink = self.event_tx.clone();
        let stats = self.stats.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            let stats = stats.clone();
            Box::pin(async move {
                if !msg.is_string {
                    return;
                }
                stats.messages_received.fetch_add(1, Ordering::Relaxed);

                match serde_json::from_slice::<ServerEvent>(&msg.data) {
                    Ok(event) => {
                        if let Some(mapped) = event.into_transport_event() {
                            deliver(&sink, mapped).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Unparseable upstream event");
                    }
                }
            })
        }));

        // Assistant audio arrives on a remote track. We drain the RTP so
        // RTCP reporting stays healthy; playback-ended tracking rides the
        // data channel events, not the media path.
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            tracing::debug!(kind = ?track.kind(), "Received remote track");
            Box::pin(async move {
                while track.read_rtp().await.is_ok() {}
                tracing::debug!("Remote track ended");
            })
        }));

        // Gather ICE before posting; the upstream endpoint does a single
        // non-trickle exchange.
        let (gather_tx, gather_rx) = oneshot::channel::<()>();
        let gather_tx = Arc::new(Mutex::new(Some(gather_tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            if state == RTCIceGathererState::Complete {
                if let Some(tx) = gather_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
            Box::pin(async {})
        }));

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Offer, e.to_string()))?;

        // Setting the local description starts ICE gathering
        pc.set_local_description(offer)
            .await
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Offer, e.to_string()))?;

        let gather_timeout = Duration::from_secs(
            colloquy_config::constants::webrtc::ICE_GATHER_TIMEOUT_SECS,
        );
        match tokio::time::timeout(gather_timeout, gather_rx).await {
            Ok(Ok(())) => {
                tracing::debug!("ICE gathering complete");
            }
            Ok(Err(_)) => {
                tracing::debug!("ICE gathering channel closed (possibly already complete)");
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?gather_timeout,
                    "ICE gathering timed out, posting offer with partial candidates"
                );
            }
        }

        let offer_sdp = match pc.local_description().await {
            Some(desc) => desc.sdp,
            None => {
                return Err(TransportError::negotiation(
                    NegotiationPhase::Offer,
                    "local description missing after gathering",
                ))
            }
        };

        tracing::info!(url = %self.config.realtime_url, model = %self.config.model, "Posting SDP offer");
        let answer_sdp = self.exchange_sdp(token, offer_sdp).await?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Answer, e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| TransportError::negotiation(NegotiationPhase::Answer, e.to_string()))?;

        // Connected means the data channel is usable, not just that ICE
        // found a pair. Fail fast if the peer connection dies first.
        let connected = async {
            tokio::select! {
                _ = open_rx => Ok(()),
                _ = failed_rx => Err(TransportError::negotiation(
                    NegotiationPhase::Ice,
                    "ICE connectivity failed",
                )),
            }
        };
        match tokio::time::timeout(self.config.connect_timeout, connected).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::negotiation(
                    NegotiationPhase::DataChannel,
                    "timed out waiting for data channel open",
                ))
            }
        }

        // Outbound writer: send() stays synchronous by handing messages
        // to this task.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let dc_writer = dc.clone();
        let stats = self.stats.clone();
        self.writer_task = Some(tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                match dc_writer.send_text(text).await {
                    Ok(_) => {
                        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Data channel send failed");
                    }
                }
            }
        }));
        self.outbound_tx = Some(out_tx);

        // Microphone goes live last, once the session is actually usable
        let capture = self.mic.acquire().await?;
        self.mic_task = Some(self.spawn_mic_pump(capture, encoder, track));

        *self.state.write() = TransportState::Connected;
        tracing::info!("Transport connected, data channel open");

        Ok(())
    }

    fn send(&self, event: &ClientEvent) {
        if !self.dc_open.load(Ordering::Acquire) {
            tracing::warn!("Dropping control message, data channel not open");
            return;
        }

        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize control message");
                return;
            }
        };

        if let Some(tx) = &self.outbound_tx {
            if tx.send(payload).is_err() {
                tracing::warn!("Data channel writer gone, message dropped");
            }
        }
    }

    fn set_event_sink(&mut self, sink: mpsc::Sender<TransportEvent>) {
        *self.event_tx.write() = Some(sink);
    }

    async fn disconnect(&mut self) {
        // Stop delivering events before tearing anything down so the
        // session never observes its own teardown as a failure.
        *self.event_tx.write() = None;

        if let Some(task) = self.mic_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        self.outbound_tx = None;
        self.dc_open.store(false, Ordering::Release);

        if let Some(pc) = self.peer_connection.take() {
            if let Err(e) = pc.close().await {
                tracing::debug!(error = %e, "Peer connection close reported an error");
            }
        }

        *self.state.write() = TransportState::Closed;
    }

    fn state(&self) -> TransportState {
        *self.state.read()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            audio_frames_sent: self.stats.audio_frames_sent.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        // The mic task owns the capture handle; aborting it releases the
        // device even if disconnect was never awaited.
        if let Some(task) = self.mic_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

/// Factory handing out fresh one-shot transports
pub struct RealtimeTransportFactory {
    config: RealtimeTransportConfig,
    mic: Arc<dyn MicrophoneSource>,
}

impl RealtimeTransportFactory {
    pub fn new(config: RealtimeTransportConfig, mic: Arc<dyn MicrophoneSource>) -> Self {
        Self { config, mic }
    }
}

impl TransportFactory for RealtimeTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(RealtimeTransport::new(self.config.clone(), self.mic.clone()))
    }
}
