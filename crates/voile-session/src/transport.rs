//! Transport session: owns the peer connection and its single ordered
//! data channel, and surfaces connection-state transitions and channel
//! messages as events.
//!
//! The data channel is created by the initiator and adopted by the
//! receiver via `on_data_channel`; both sides install the same message
//! handler. Local descriptions are committed when ICE gathering
//! completes or the gathering timeout elapses, whichever comes first,
//! and travel through the signaling record base64-encoded.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use voile_shared::constants::{
    BUFFER_LOW_WATER, DATA_CHANNEL_LABEL, GATHERING_TIMEOUT, STUN_URL, TURN_CREDENTIAL,
    TURN_URL, TURN_USERNAME,
};
use voile_shared::protocol::Frame;

use crate::media::TrackKind;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("data channel not open")]
    ChannelNotOpen,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("no local description after gathering")]
    MissingLocalDescription,

    #[error("frame encoding failed: {0}")]
    Frame(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A remote media track arrived; it belongs to the remote
    /// participant's stream.
    RemoteTrack { kind: TrackKind },
    /// The data channel is open on this side; protocol frames may flow.
    ChannelOpen,
    /// A JSON text frame arrived.
    TextMessage(String),
    /// A binary `nonce ‖ ciphertext` chunk arrived.
    BinaryMessage(Bytes),
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
    pub candidate_pool_size: u8,
    /// Allow host candidates on the loopback interface. Off for real
    /// calls; the in-process test and demo peers need it.
    pub include_loopback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer {
                    urls: vec![STUN_URL.to_string()],
                    username: String::new(),
                    credential: String::new(),
                },
                IceServer {
                    urls: vec![TURN_URL.to_string()],
                    username: TURN_USERNAME.to_string(),
                    credential: TURN_CREDENTIAL.to_string(),
                },
            ],
            candidate_pool_size: 2,
            include_loopback: false,
        }
    }
}

impl TransportConfig {
    /// Loopback-only configuration for same-host peers: no STUN/TURN,
    /// so gathering completes immediately.
    pub fn loopback() -> Self {
        Self {
            ice_servers: Vec::new(),
            candidate_pool_size: 0,
            include_loopback: true,
        }
    }
}

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub struct TransportSession {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    buffer_gate: Arc<Notify>,
}

impl TransportSession {
    /// Build the initiator side: the data channel is created here.
    pub async fn for_initiator(
        config: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let (session, events, rx) = Self::build(config).await?;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = session
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await?;
        attach_channel(dc, &session.channel, &session.buffer_gate, &events).await;

        Ok((session, rx))
    }

    /// Build the receiver side: the channel is adopted when the peer's
    /// offer arrives.
    pub async fn for_receiver(
        config: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let (session, events, rx) = Self::build(config).await?;

        let slot = session.channel.clone();
        let gate = session.buffer_gate.clone();
        let tx = events.clone();
        session.pc.on_data_channel(Box::new(move |dc| {
            let slot = slot.clone();
            let gate = gate.clone();
            let tx = tx.clone();
            Box::pin(async move {
                debug!(label = %dc.label(), "data channel adopted");
                attach_channel(dc, &slot, &gate, &tx).await;
            })
        }));

        Ok((session, rx))
    }

    async fn build(
        config: TransportConfig,
    ) -> Result<
        (
            Self,
            mpsc::Sender<TransportEvent>,
            mpsc::Receiver<TransportEvent>,
        ),
        TransportError,
    > {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let mut setting_engine = SettingEngine::default();
        if config.include_loopback {
            setting_engine.set_include_loopback_candidate(true);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: config.candidate_pool_size,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx
                    .send(TransportEvent::StateChanged(map_state(state)))
                    .await;
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                let _ = tx.send(TransportEvent::RemoteTrack { kind }).await;
            })
        }));

        Ok((
            Self {
                pc,
                channel: Arc::new(Mutex::new(None)),
                buffer_gate: Arc::new(Notify::new()),
            },
            events,
            rx,
        ))
    }

    /// Create and commit the local offer, returning it base64-encoded.
    pub async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        committed_local_description(&self.pc).await
    }

    /// Apply the peer's offer as the remote description.
    pub async fn accept_offer(&self, offer_b64: &str) -> Result<(), TransportError> {
        let desc = decode_description(offer_b64)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    /// Create and commit the local answer, returning it base64-encoded.
    pub async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        committed_local_description(&self.pc).await
    }

    /// Apply the peer's answer as the remote description.
    pub async fn accept_answer(&self, answer_b64: &str) -> Result<(), TransportError> {
        let desc = decode_description(answer_b64)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    /// Whether the negotiation state admits a renegotiation.
    pub fn is_stable(&self) -> bool {
        self.pc.signaling_state() == RTCSignalingState::Stable
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel()
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false)
    }

    /// Send a JSON protocol frame as a text message.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let dc = self.open_channel()?;
        let json = frame
            .to_json()
            .map_err(|e| TransportError::Frame(e.to_string()))?;
        dc.send_text(json).await?;
        Ok(())
    }

    /// Send an opaque binary chunk.
    pub async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        let dc = self.open_channel()?;
        dc.send(&data).await?;
        Ok(())
    }

    pub async fn buffered_amount(&self) -> usize {
        match self.channel() {
            Some(dc) => dc.buffered_amount().await,
            None => 0,
        }
    }

    /// Resolves the next time the channel's buffered amount drops below
    /// the low-water mark.
    pub async fn buffered_low(&self) {
        self.buffer_gate.notified().await;
    }

    fn open_channel(&self) -> Result<Arc<RTCDataChannel>, TransportError> {
        let dc = self.channel().ok_or(TransportError::ChannelNotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelNotOpen);
        }
        Ok(dc)
    }

    /// Null every handler, then close the channel and the connection.
    /// Handlers are cleared first so no callback fires into a session
    /// that is being torn down.
    pub async fn shutdown(&self) {
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_data_channel(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_ice_gathering_state_change(Box::new(|_| Box::pin(async {})));

        if let Some(dc) = self.channel() {
            dc.on_open(Box::new(|| Box::pin(async {})));
            dc.on_message(Box::new(|_| Box::pin(async {})));
            dc.on_close(Box::new(|| Box::pin(async {})));
            if let Err(e) = dc.close().await {
                debug!(error = %e, "data channel close");
            }
        }
        if let Ok(mut slot) = self.channel.lock() {
            *slot = None;
        }

        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}

/// Install the shared message handlers on a data channel, wire up the
/// backpressure gate, and publish it into the session's channel slot.
async fn attach_channel(
    dc: Arc<RTCDataChannel>,
    slot: &ChannelSlot,
    gate: &Arc<Notify>,
    events: &mpsc::Sender<TransportEvent>,
) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelOpen).await;
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = if message.is_string {
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => TransportEvent::TextMessage(text),
                    Err(_) => {
                        warn!("dropping non-UTF-8 text frame");
                        return;
                    }
                }
            } else {
                TransportEvent::BinaryMessage(message.data)
            };
            let _ = tx.send(event).await;
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelClosed).await;
        })
    }));

    dc.set_buffered_amount_low_threshold(BUFFER_LOW_WATER).await;
    let gate_handle = gate.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let gate_handle = gate_handle.clone();
        Box::pin(async move {
            gate_handle.notify_waiters();
        })
    }))
    .await;

    if let Ok(mut guard) = slot.lock() {
        *guard = Some(dc);
    }
}

/// Wait for ICE gathering to complete, capped by the gathering timeout,
/// then return the committed local description base64-encoded.
async fn committed_local_description(
    pc: &Arc<RTCPeerConnection>,
) -> Result<String, TransportError> {
    if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    if let Ok(mut guard) = tx.lock() {
                        if let Some(tx) = guard.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            })
        }));

        // Whichever comes first wins; on timeout the description is
        // committed with the candidates gathered so far.
        if timeout(GATHERING_TIMEOUT, rx).await.is_err() {
            debug!("ICE gathering timed out, committing local description");
        }
    }

    let desc = pc
        .local_description()
        .await
        .ok_or(TransportError::MissingLocalDescription)?;
    let json =
        serde_json::to_string(&desc).map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

// The transfer engine drives the channel through this narrow seam.
#[async_trait::async_trait]
impl crate::transfer::ChunkSink for TransportSession {
    async fn send_frame(&self, frame: &Frame) -> Result<(), crate::transfer::TransferError> {
        TransportSession::send_frame(self, frame)
            .await
            .map_err(|e| crate::transfer::TransferError::Channel(e.to_string()))
    }

    async fn send_chunk(&self, chunk: Bytes) -> Result<(), crate::transfer::TransferError> {
        self.send_binary(chunk)
            .await
            .map_err(|e| crate::transfer::TransferError::Channel(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        TransportSession::buffered_amount(self).await
    }

    async fn buffered_low(&self) {
        TransportSession::buffered_low(self).await;
    }

    fn is_open(&self) -> bool {
        self.is_channel_open()
    }
}

fn decode_description(encoded: &str) -> Result<RTCSessionDescription, TransportError> {
    let json = STANDARD
        .decode(encoded)
        .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initiator_has_channel_before_open() {
        let (session, _rx) = TransportSession::for_initiator(TransportConfig::loopback())
            .await
            .unwrap();
        // The channel exists but is not yet open: sends must be refused.
        assert!(!session.is_channel_open());
        assert!(matches!(
            session.send_frame(&Frame::SessionTerminate {}).await,
            Err(TransportError::ChannelNotOpen)
        ));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_receiver_has_no_channel_until_adopted() {
        let (session, _rx) = TransportSession::for_receiver(TransportConfig::loopback())
            .await
            .unwrap();
        assert!(!session.is_channel_open());
        assert_eq!(session.buffered_amount().await, 0);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_offer_is_base64_session_description() {
        let (session, _rx) = TransportSession::for_initiator(TransportConfig::loopback())
            .await
            .unwrap();
        let offer = session.create_offer().await.unwrap();
        let decoded = decode_description(&offer).unwrap();
        assert!(!decoded.sdp.is_empty());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_garbage_description_rejected() {
        assert!(decode_description("not-base64!!").is_err());
        let bogus = STANDARD.encode("{\"not\":\"an sdp\"}");
        assert!(decode_description(&bogus).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (session, _rx) = TransportSession::for_initiator(TransportConfig::loopback())
            .await
            .unwrap();
        session.shutdown().await;
        session.shutdown().await;
    }
}
