//! The session event loop.
//!
//! All state transitions happen on one task: commands from the embedder,
//! change notifications from the rendezvous store, transport events, the
//! heartbeat, and the reconnect timer are multiplexed with `select!`.
//! Callbacks from the WebRTC stack never mutate session state directly;
//! they only forward events into this loop's queues.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voile_rendezvous::{RoomEvent, RoomSubscription, SignalStore, StoreError};
use voile_shared::constants::{
    HANDSHAKE_TIMEOUT, HEARTBEAT_FAILURE_LIMIT, HEARTBEAT_INTERVAL, NEGOTIATION_THROTTLE,
};
use voile_shared::crypto::{self, SessionKey};
use voile_shared::error::SessionFault;
use voile_shared::link::MagicLink;
use voile_shared::protocol::Frame;
use voile_shared::types::{PeerId, PeerRole, PrivacyMode, RoomId};

use crate::events::{OutgoingFile, SessionCommand, SessionEvent, TransferDirection};
use crate::governor::{ActiveTransfer, ResourceGovernor};
use crate::media::{acquire_with_fallback, MediaPipeline, MediaStream, MediaTrack, TrackKind};
use crate::participant::{Participant, ParticipantView};
use crate::signaling::{
    elect_role, ElectionOutcome, HandshakeGuards, ReconnectReason, SessionState,
};
use crate::transfer::{self, InboundAssembly};
use crate::transport::{
    TransportConfig, TransportError, TransportEvent, TransportSession, TransportState,
};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Brief pause between surfacing a passphrase mismatch and leaving the
/// session, so the embedder can show the error.
const MISMATCH_GRACE: std::time::Duration = std::time::Duration::from_millis(250);

/// Head start for the `session-terminate` frame before the channel is
/// torn down underneath it.
const TERMINATE_FLUSH: std::time::Duration = std::time::Duration::from_millis(50);

/// Immutable configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: RoomId,
    /// Never persisted, never transmitted, never logged.
    pub passphrase: String,
    pub display_name: String,
    pub privacy: PrivacyMode,
    pub recording_protection: bool,
    pub ephemeral: bool,
    pub transport: TransportConfig,
}

impl SessionConfig {
    pub fn new(room: &str, passphrase: &str, display_name: &str) -> Self {
        Self {
            room: RoomId::new(room),
            passphrase: passphrase.to_string(),
            display_name: display_name.to_string(),
            privacy: PrivacyMode::default(),
            recording_protection: false,
            ephemeral: false,
            transport: TransportConfig::default(),
        }
    }

    /// Session entry from a magic link: generated guest display name,
    /// privacy mode `none`.
    pub fn from_link(link: &MagicLink) -> Self {
        Self {
            room: link.room.clone(),
            passphrase: link.passphrase.clone(),
            display_name: format!("Guest-{:04X}", rand::random::<u16>()),
            privacy: PrivacyMode::None,
            recording_protection: false,
            ephemeral: false,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Error, Debug)]
#[error("session task is no longer running")]
pub struct SessionClosed;

/// Handle for driving a running session.
#[derive(Clone)]
pub struct SessionHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub async fn command(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        self.commands.send(command).await.map_err(|_| SessionClosed)
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.command(SessionCommand::SendChat(text.into())).await
    }

    pub async fn set_privacy(&self, mode: PrivacyMode) -> Result<(), SessionClosed> {
        self.command(SessionCommand::SetPrivacy(mode)).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionClosed> {
        self.command(SessionCommand::SetMuted(muted)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), SessionClosed> {
        self.command(SessionCommand::SetVideoEnabled(enabled)).await
    }

    pub async fn send_file(&self, file: OutgoingFile) -> Result<(), SessionClosed> {
        self.command(SessionCommand::SendFile(file)).await
    }

    pub async fn cancel_file_transfer(&self) -> Result<(), SessionClosed> {
        self.command(SessionCommand::CancelFileTransfer).await
    }

    pub async fn renegotiate(&self) -> Result<(), SessionClosed> {
        self.command(SessionCommand::Renegotiate).await
    }

    pub async fn visibility_changed(&self, visible: bool) -> Result<(), SessionClosed> {
        self.command(SessionCommand::VisibilityChanged { visible })
            .await
    }

    pub async fn exit(&self) -> Result<(), SessionClosed> {
        self.command(SessionCommand::Exit).await
    }
}

/// Spawn the session task. The peer identifier is generated here and
/// stays stable across reconnects for the lifetime of the handle; a new
/// handle is a new peer.
pub fn spawn_session(
    config: SessionConfig,
    store: Arc<dyn SignalStore>,
    media: Arc<dyn MediaPipeline>,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let peer_id = PeerId::generate();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    info!(room = %config.room, peer = %peer_id.short(), "starting session");
    tokio::spawn(run(config, peer_id, store, media, cmd_rx, event_tx));

    (
        SessionHandle {
            peer_id,
            commands: cmd_tx,
        },
        event_rx,
    )
}

/// Notices from the session's own background tasks.
#[derive(Debug)]
enum InternalNote {
    TransferFinished {
        id: Uuid,
        result: Result<(), transfer::TransferError>,
    },
}

#[derive(Error, Debug)]
enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Runtime {
    config: SessionConfig,
    peer_id: PeerId,
    fingerprint: String,
    key: SessionKey,
    store: Arc<dyn SignalStore>,
    media: Arc<dyn MediaPipeline>,
    events: mpsc::Sender<SessionEvent>,
    notes: mpsc::Sender<InternalNote>,

    state: SessionState,
    role: Option<PeerRole>,
    /// Whether we currently hold a slot in the room record (initiator
    /// insert succeeded or receiver claim matched).
    occupies_slot: bool,
    guards: HandshakeGuards,
    governor: ResourceGovernor,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,

    local: Participant,
    remote: Option<Participant>,
    privacy: PrivacyMode,
    muted: bool,

    /// The offer currently applied as our remote description (receiver
    /// side); a row whose offer differs carries a renegotiation.
    applied_offer: Option<String>,
    inbound: Option<InboundAssembly>,
    heartbeat_failures: u32,
    reconnect_at: Option<(Instant, ReconnectReason)>,
    last_negotiation: Option<Instant>,
    finished: bool,
}

async fn run(
    config: SessionConfig,
    peer_id: PeerId,
    store: Arc<dyn SignalStore>,
    media: Arc<dyn MediaPipeline>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
) {
    let fingerprint = crypto::fingerprint(&config.passphrase);
    let key = match crypto::derive_session_key(&config.passphrase, &config.room) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "session key derivation failed");
            let _ = events
                .send(SessionEvent::StateChanged(SessionState::SecurityError))
                .await;
            let _ = events
                .send(SessionEvent::Fault(SessionFault::SecurityError))
                .await;
            return;
        }
    };

    let local_stream = match acquire_with_fallback(media.as_ref(), config.privacy).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "media acquisition failed");
            let _ = events
                .send(SessionEvent::StateChanged(SessionState::MediaError))
                .await;
            let _ = events
                .send(SessionEvent::Fault(SessionFault::MediaError))
                .await;
            return;
        }
    };

    let (notes_tx, mut notes_rx) = mpsc::channel(16);
    let local = Participant::local(config.display_name.clone(), local_stream.clone());
    let mut rt = Runtime {
        config,
        peer_id,
        fingerprint,
        key,
        store,
        media,
        events,
        notes: notes_tx,
        state: SessionState::Idle,
        role: None,
        occupies_slot: false,
        guards: HandshakeGuards::default(),
        governor: ResourceGovernor::new(),
        transport_events: None,
        local,
        remote: None,
        privacy: PrivacyMode::default(),
        muted: false,
        applied_offer: None,
        inbound: None,
        heartbeat_failures: 0,
        reconnect_at: None,
        last_negotiation: None,
        finished: false,
    };
    rt.privacy = rt.config.privacy;
    rt.governor.set_local_media(local_stream);
    rt.emit_participants().await;
    rt.set_state(SessionState::Preparing).await;

    match rt.store.subscribe(&rt.config.room).await {
        Ok(subscription) => {
            rt.governor.subscription = Some(subscription);
            rt.begin_signaling().await;
        }
        Err(e) => {
            warn!(error = %e, "could not subscribe to room notifications");
            rt.emit(SessionEvent::Warning(
                "rendezvous service unreachable".into(),
            ))
            .await;
            rt.schedule_reconnect(ReconnectReason::StoreTrouble);
        }
    }

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if rt.finished {
            break;
        }
        let reconnect_due = rt.reconnect_at;

        tokio::select! {
            maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                Some(command) => rt.handle_command(command).await,
                // The handle was dropped: exit like a local teardown.
                None => rt.handle_command(SessionCommand::Exit).await,
            },
            Some(event) = next_room_event(&mut rt.governor.subscription) => {
                rt.handle_room_event(event).await;
            }
            Some(event) = next_transport_event(&mut rt.transport_events) => {
                rt.handle_transport_event(event).await;
            }
            Some(note) = notes_rx.recv() => rt.handle_note(note).await,
            _ = heartbeat.tick() => rt.heartbeat_tick().await,
            _ = reconnect_timer(reconnect_due) => {
                if let Some((_, reason)) = rt.reconnect_at.take() {
                    rt.run_reconnect(reason).await;
                }
            }
        }
    }

    info!(peer = %rt.peer_id.short(), "session task finished");
}

async fn next_room_event(subscription: &mut Option<RoomSubscription>) -> Option<RoomEvent> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn next_transport_event(
    receiver: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(due: Option<(Instant, ReconnectReason)>) {
    match due {
        Some((at, _)) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handshake RPCs against the store are capped; a timeout falls back to
/// reconnect scheduling like any other handshake failure.
async fn handshake_rpc<T>(
    rpc: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, rpc).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Backend("rendezvous call timed out".into())),
    }
}

impl Runtime {
    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    async fn emit_participants(&self) {
        self.emit(SessionEvent::ParticipantsChanged(ParticipantView {
            local: self.local.clone(),
            remote: self.remote.clone(),
        }))
        .await;
    }

    async fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "session state");
            self.state = state;
            self.emit(SessionEvent::StateChanged(state)).await;
        }
    }

    fn channel_open(&self) -> bool {
        self.governor
            .transport()
            .map(|t| t.is_channel_open())
            .unwrap_or(false)
    }

    async fn send_frame(&self, frame: Frame) {
        let Some(transport) = self.governor.transport() else {
            return;
        };
        if let Err(e) = transport.send_frame(&frame).await {
            warn!(error = %e, "failed to send frame");
        }
    }

    async fn send_privacy_update(&self) {
        if !self.channel_open() {
            return;
        }
        self.send_frame(Frame::PrivacyUpdate {
            filter: self.privacy,
            audio_enabled: self.local.audio_enabled,
            video_enabled: self.local.video_enabled,
        })
        .await;
    }

    fn schedule_reconnect(&mut self, reason: ReconnectReason) {
        if self.finished || self.state.is_terminal() {
            return;
        }
        // At most one pending reconnect timer.
        if self.reconnect_at.is_some() {
            debug!("reconnect already pending");
            return;
        }
        debug!(reason = ?reason, delay_ms = reason.delay().as_millis() as u64, "reconnect scheduled");
        self.reconnect_at = Some((Instant::now() + reason.delay(), reason));
    }

    /// Full resource release: transport handlers nulled and closed,
    /// tracks stopped, received files dropped, subscription removed,
    /// transfer canceled, signaling flags reset. Idempotent.
    async fn cleanup(&mut self) {
        self.governor.cleanup().await;
        self.transport_events = None;
        self.guards.reset();
        self.applied_offer = None;
        self.reconnect_at = None;
        self.inbound = None;
        self.remote = None;
        self.role = None;
        self.heartbeat_failures = 0;
        self.local.stream = None;
    }

    async fn terminate(&mut self) {
        if self.occupies_slot {
            let _ = self.store.delete(&self.config.room).await;
            self.occupies_slot = false;
        }
        self.cleanup().await;
        if !self.state.is_terminal() {
            self.set_state(SessionState::Idle).await;
        }
        self.emit(SessionEvent::Terminated).await;
        self.finished = true;
    }

    async fn fault(&mut self, fault: SessionFault) {
        let state = match fault {
            SessionFault::SecurityError => SessionState::SecurityError,
            SessionFault::MediaError => SessionState::MediaError,
            SessionFault::RoomFull => SessionState::RoomFull,
        };
        warn!(fault = %fault, "terminal session fault");
        if self.occupies_slot {
            let _ = self.store.delete(&self.config.room).await;
            self.occupies_slot = false;
        }
        self.set_state(state).await;
        self.emit(SessionEvent::Fault(fault)).await;
        self.cleanup().await;
        self.finished = true;
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    async fn begin_signaling(&mut self) {
        if self.guards.signaling_in_progress {
            debug!("signaling already in progress");
            return;
        }
        if self.finished || self.state.is_terminal() {
            return;
        }
        self.guards.signaling_in_progress = true;
        self.set_state(SessionState::Preparing).await;

        match elect_role(
            self.store.as_ref(),
            &self.config.room,
            self.peer_id,
            &self.fingerprint,
        )
        .await
        {
            Err(e) => {
                // Keep the subscription alive: a change notification can
                // retrigger the election.
                warn!(error = %e, "role election failed");
                self.emit(SessionEvent::Warning(
                    "rendezvous service unreachable".into(),
                ))
                .await;
            }
            Ok(ElectionOutcome::Initiator) => {
                info!(room = %self.config.room, "elected initiator");
                self.role = Some(PeerRole::Initiator);
                self.occupies_slot = true;
                self.start_initiator_handshake().await;
            }
            Ok(ElectionOutcome::Receiver { offer }) => {
                info!(room = %self.config.room, "elected receiver");
                self.role = Some(PeerRole::Receiver);
                self.start_receiver_handshake(offer).await;
            }
            Ok(ElectionOutcome::AwaitOffer) => {
                debug!("initiator slot taken, offer not yet published; waiting");
                self.role = Some(PeerRole::Receiver);
            }
            Ok(ElectionOutcome::RoomFull) => self.fault(SessionFault::RoomFull).await,
            Ok(ElectionOutcome::PassphraseMismatch) => {
                warn!(room = %self.config.room, "passphrase fingerprint mismatch");
                self.emit(SessionEvent::Warning(
                    "passphrase does not match this room".into(),
                ))
                .await;
                tokio::time::sleep(MISMATCH_GRACE).await;
                self.terminate().await;
            }
            Ok(ElectionOutcome::Exhausted) => {
                self.schedule_reconnect(ReconnectReason::SignalingRace)
            }
        }
        self.guards.signaling_in_progress = false;
    }

    async fn start_initiator_handshake(&mut self) {
        if let Err(e) = self.try_initiator_handshake().await {
            warn!(error = %e, "initiator handshake failed");
            self.emit(SessionEvent::Warning("connection setup failed".into()))
                .await;
            self.schedule_reconnect(ReconnectReason::StoreTrouble);
        }
    }

    async fn try_initiator_handshake(&mut self) -> Result<(), HandshakeError> {
        let (transport, rx) =
            TransportSession::for_initiator(self.config.transport.clone()).await?;
        let transport = Arc::new(transport);
        self.transport_events = Some(rx);
        self.governor.set_transport(transport.clone());

        // Committed at gathering completion or the 4 s cap.
        let offer = transport.create_offer().await?;
        let published =
            handshake_rpc(self.store.publish_offer(&self.config.room, self.peer_id, &offer))
                .await?;
        if !published {
            warn!("offer publish matched no row; the record changed under us");
            self.schedule_reconnect(ReconnectReason::SignalingRace);
        }
        Ok(())
    }

    async fn start_receiver_handshake(&mut self, offer: String) {
        // Exactly-once application even under duplicate deliveries.
        if self.guards.processed_offer {
            return;
        }
        self.guards.processed_offer = true;
        if let Err(e) = self.try_receiver_handshake(offer).await {
            warn!(error = %e, "receiver handshake failed");
            self.emit(SessionEvent::Warning("connection setup failed".into()))
                .await;
            self.schedule_reconnect(ReconnectReason::StoreTrouble);
        }
    }

    async fn try_receiver_handshake(&mut self, offer: String) -> Result<(), HandshakeError> {
        let (transport, rx) =
            TransportSession::for_receiver(self.config.transport.clone()).await?;
        let transport = Arc::new(transport);
        self.transport_events = Some(rx);
        self.governor.set_transport(transport.clone());

        transport.accept_offer(&offer).await?;
        self.applied_offer = Some(offer);
        let answer = transport.create_answer().await?;

        let claimed =
            handshake_rpc(self.store.claim_receiver(&self.config.room, self.peer_id, &answer))
                .await?;
        if claimed {
            self.occupies_slot = true;
            self.set_state(SessionState::Ready).await;
            return Ok(());
        }

        // Zero rows affected: either we lost the race or our earlier
        // claim succeeded and its acknowledgment was lost.
        match handshake_rpc(self.store.fetch(&self.config.room)).await? {
            Some(row) if row.receiver_id == Some(self.peer_id) => {
                self.occupies_slot = true;
                self.set_state(SessionState::Ready).await;
            }
            _ => self.fault(SessionFault::RoomFull).await,
        }
        Ok(())
    }

    /// Answer a renegotiated offer on the existing transport. The fresh
    /// answer is written through the receiver-predicated conditional, so
    /// a row that moved on under us is a no-op.
    async fn apply_renegotiated_offer(&mut self, offer: String) {
        let Some(transport) = self.governor.transport().cloned() else {
            return;
        };
        debug!("applying renegotiated offer");
        let result: Result<bool, HandshakeError> = async {
            transport.accept_offer(&offer).await?;
            let answer = transport.create_answer().await?;
            let wrote = handshake_rpc(self.store.write_answer(
                &self.config.room,
                self.peer_id,
                &answer,
            ))
            .await?;
            Ok(wrote)
        }
        .await;

        match result {
            Ok(wrote) => {
                if !wrote {
                    warn!("renegotiated answer matched no row");
                }
                self.applied_offer = Some(offer);
            }
            Err(e) => {
                warn!(error = %e, "renegotiation failed");
                self.emit(SessionEvent::Warning("connection setup failed".into()))
                    .await;
                self.schedule_reconnect(ReconnectReason::SignalingRace);
            }
        }
    }

    async fn run_reconnect(&mut self, reason: ReconnectReason) {
        if self.finished || self.state.is_terminal() {
            return;
        }
        info!(reason = ?reason, "reconnecting");

        // Release our slot so the fresh election is not blocked by our
        // own still-fresh record.
        if self.occupies_slot {
            let _ = self.store.delete(&self.config.room).await;
            self.occupies_slot = false;
        }
        self.cleanup().await;
        self.set_state(SessionState::Preparing).await;

        match acquire_with_fallback(self.media.as_ref(), self.privacy).await {
            Ok(stream) => self.adopt_local_media(stream).await,
            Err(e) => {
                warn!(error = %e, "media re-acquisition failed");
                self.fault(SessionFault::MediaError).await;
                return;
            }
        }

        match self.store.subscribe(&self.config.room).await {
            Ok(subscription) => self.governor.subscription = Some(subscription),
            Err(e) => {
                warn!(error = %e, "resubscribe failed");
                self.emit(SessionEvent::Warning(
                    "rendezvous service unreachable".into(),
                ))
                .await;
                self.schedule_reconnect(ReconnectReason::StoreTrouble);
                return;
            }
        }

        self.begin_signaling().await;
    }

    async fn adopt_local_media(&mut self, stream: MediaStream) {
        if self.muted {
            if let Some(track) = &stream.audio {
                track.set_enabled(false);
            }
        }
        self.local.audio_enabled = stream.audio.is_some() && !self.muted;
        self.local.video_enabled = stream.has_video();
        self.local.stream = Some(stream.clone());
        self.governor.set_local_media(stream);
        self.emit_participants().await;
    }

    // ------------------------------------------------------------------
    // Room change notifications
    // ------------------------------------------------------------------

    async fn handle_room_event(&mut self, event: RoomEvent) {
        if self.finished || self.state.is_terminal() {
            return;
        }
        // Change callbacks skip mutating actions while a signaling pass
        // is running.
        if self.guards.signaling_in_progress {
            debug!("change notification during signaling pass, skipped");
            return;
        }

        match event {
            RoomEvent::Inserted(row) | RoomEvent::Updated(row) => match self.role {
                Some(PeerRole::Initiator) => {
                    if self.guards.processed_answer || row.initiator_id != self.peer_id {
                        return;
                    }
                    let Some(answer) = row.answer.clone() else {
                        return;
                    };
                    self.guards.processed_answer = true;
                    let Some(transport) = self.governor.transport().cloned() else {
                        return;
                    };
                    match transport.accept_answer(&answer).await {
                        Ok(()) => {
                            // A renegotiated answer lands while already
                            // connected; only the first one advances the
                            // lifecycle.
                            if self.state != SessionState::Connected {
                                self.set_state(SessionState::Ready).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to apply peer answer");
                            self.emit(SessionEvent::Warning(
                                "connection setup failed".into(),
                            ))
                            .await;
                            self.schedule_reconnect(ReconnectReason::SignalingRace);
                        }
                    }
                }
                Some(PeerRole::Receiver) => {
                    let Some(offer) = row.real_offer().map(str::to_string) else {
                        return;
                    };
                    if !self.guards.processed_offer {
                        self.start_receiver_handshake(offer).await;
                    } else if self.applied_offer.as_deref() != Some(offer.as_str()) {
                        self.apply_renegotiated_offer(offer).await;
                    }
                }
                None => self.begin_signaling().await,
            },
            RoomEvent::Deleted => self.handle_room_deleted().await,
        }
    }

    async fn handle_room_deleted(&mut self) {
        if self.state == SessionState::Connected {
            // The media path is peer-to-peer; a deleted record does not
            // affect an established session.
            debug!("room record deleted while connected");
            return;
        }
        // Deletions we caused ourselves still show a row that involves
        // us on re-read; anything else means the room moved on.
        match self.store.fetch(&self.config.room).await {
            Ok(Some(row)) if row.has_occupant(self.peer_id) => {}
            Ok(_) => self.schedule_reconnect(ReconnectReason::SignalingRace),
            Err(e) => {
                warn!(error = %e, "re-read after room deletion failed");
                self.schedule_reconnect(ReconnectReason::StoreTrouble);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.finished {
            return;
        }
        match event {
            TransportEvent::StateChanged(TransportState::Connected) => {
                self.heartbeat_failures = 0;
                if self.remote.is_none() {
                    self.remote = Some(Participant::remote_placeholder());
                }
                self.set_state(SessionState::Connected).await;
                self.emit_participants().await;
            }
            TransportEvent::StateChanged(TransportState::Failed)
            | TransportEvent::StateChanged(TransportState::Closed) => {
                if self.state.is_terminal() {
                    return;
                }
                warn!("transport lost");
                self.emit(SessionEvent::Warning("connection lost".into()))
                    .await;
                self.schedule_reconnect(ReconnectReason::ConnectionLost);
            }
            TransportEvent::StateChanged(state) => {
                debug!(state = ?state, "transport state");
            }
            TransportEvent::RemoteTrack { kind } => {
                let remote = self.remote.get_or_insert_with(Participant::remote_placeholder);
                let stream = remote.stream.get_or_insert_with(MediaStream::default);
                match kind {
                    TrackKind::Audio => stream.audio = Some(MediaTrack::new(TrackKind::Audio)),
                    TrackKind::Video => stream.video = Some(MediaTrack::new(TrackKind::Video)),
                }
                debug!(kind = ?kind, "remote track attached");
                self.emit_participants().await;
            }
            TransportEvent::ChannelOpen => {
                self.send_frame(Frame::PeerInfo {
                    name: self.local.display_name.clone(),
                })
                .await;
                self.send_privacy_update().await;
            }
            TransportEvent::TextMessage(raw) => self.handle_text_frame(raw).await,
            TransportEvent::BinaryMessage(bytes) => self.handle_binary_frame(&bytes).await,
            TransportEvent::ChannelClosed => {
                debug!("data channel closed");
                if self.governor.cancel_transfer() {
                    debug!("outbound transfer canceled by channel closure");
                }
            }
        }
    }

    async fn handle_text_frame(&mut self, raw: String) {
        let frame = match Frame::from_json(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame dropped");
                return;
            }
        };

        match frame {
            Frame::Chat { data, iv } => match crypto::decrypt_text(&self.key, &data, &iv) {
                Ok(text) => self.emit(SessionEvent::ChatReceived(text)).await,
                Err(e) => warn!(error = %e, "chat frame failed to authenticate, dropped"),
            },
            Frame::PrivacyUpdate {
                filter,
                audio_enabled,
                video_enabled,
            } => {
                let remote = self.remote.get_or_insert_with(Participant::remote_placeholder);
                remote.audio_enabled = audio_enabled;
                remote.video_enabled = video_enabled;
                self.emit(SessionEvent::PeerPrivacyChanged {
                    filter,
                    audio_enabled,
                    video_enabled,
                })
                .await;
                self.emit_participants().await;
            }
            Frame::FileMeta {
                id,
                name,
                size,
                mime_type,
            } => {
                if let Some(dropped) = self.inbound.take() {
                    warn!(id = %dropped.id, "new file-meta while assembly incomplete, discarding");
                    self.emit(SessionEvent::FileFailed {
                        id: dropped.id,
                        direction: TransferDirection::Inbound,
                        reason: "superseded by a new transfer".into(),
                    })
                    .await;
                }
                self.inbound = Some(InboundAssembly::new(
                    id,
                    name.clone(),
                    size,
                    mime_type.clone(),
                ));
                self.emit(SessionEvent::FileOffered {
                    id,
                    name,
                    size,
                    mime_type,
                })
                .await;
                self.complete_assembly_if_done().await;
            }
            Frame::FileAbort { id } => {
                if self.inbound.as_ref().is_some_and(|a| a.id == id) {
                    self.inbound = None;
                    self.emit(SessionEvent::FileFailed {
                        id,
                        direction: TransferDirection::Inbound,
                        reason: "aborted by sender".into(),
                    })
                    .await;
                }
            }
            Frame::SessionTerminate {} => {
                // Treated exactly as a local exit request.
                info!("peer requested session termination");
                self.terminate().await;
            }
            Frame::PeerInfo { name } => {
                let remote = self.remote.get_or_insert_with(Participant::remote_placeholder);
                remote.display_name = name;
                self.emit_participants().await;
            }
            Frame::Unknown => debug!("unknown frame type ignored"),
        }
    }

    async fn handle_binary_frame(&mut self, bytes: &[u8]) {
        let outcome = match self.inbound.as_mut() {
            None => None,
            Some(assembly) => Some(match assembly.accept_chunk(&self.key, bytes) {
                Ok(received) => Ok((assembly.id, received, assembly.size)),
                Err(e) => Err((assembly.id, e.to_string())),
            }),
        };

        match outcome {
            None => debug!("binary frame with no assembly in progress, dropped"),
            Some(Ok((id, received, total))) => {
                self.emit(SessionEvent::FileProgress {
                    id,
                    direction: TransferDirection::Inbound,
                    transferred: received,
                    total,
                })
                .await;
                self.complete_assembly_if_done().await;
            }
            Some(Err((id, reason))) => {
                warn!(id = %id, reason = %reason, "inbound chunk rejected, assembly discarded");
                self.inbound = None;
                self.emit(SessionEvent::FileFailed {
                    id,
                    direction: TransferDirection::Inbound,
                    reason,
                })
                .await;
            }
        }
    }

    async fn complete_assembly_if_done(&mut self) {
        let done = self.inbound.as_ref().map(|a| a.is_complete()).unwrap_or(false);
        if !done {
            return;
        }
        if let Some(assembly) = self.inbound.take() {
            let id = assembly.id;
            let total = assembly.size;
            let file = assembly.into_received_file();
            info!(id = %id, name = %file.name, size = total, "file received");
            self.governor.register_received_file(file.clone());
            self.emit(SessionEvent::FileProgress {
                id,
                direction: TransferDirection::Inbound,
                transferred: total,
                total,
            })
            .await;
            self.emit(SessionEvent::FileReceived(file)).await;
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        if self.finished {
            return;
        }
        match command {
            SessionCommand::SendChat(text) => {
                if !self.channel_open() {
                    self.emit(SessionEvent::Warning("not connected, chat not sent".into()))
                        .await;
                    return;
                }
                match crypto::encrypt_text(&self.key, &text) {
                    Ok((data, iv)) => self.send_frame(Frame::Chat { data, iv }).await,
                    Err(e) => warn!(error = %e, "chat encryption failed"),
                }
            }
            SessionCommand::SetPrivacy(mode) => {
                self.privacy = mode;
                if let Err(e) = self.media.apply_privacy(mode).await {
                    warn!(error = %e, "privacy mode change rejected by pipeline");
                }
                self.send_privacy_update().await;
            }
            SessionCommand::SetMuted(muted) => {
                self.muted = muted;
                if let Some(stream) = self.governor.local_media() {
                    if let Some(track) = &stream.audio {
                        track.set_enabled(!muted);
                    }
                }
                self.local.audio_enabled = !muted;
                self.send_privacy_update().await;
                self.emit_participants().await;
            }
            SessionCommand::SetVideoEnabled(enabled) => {
                let has_video = self
                    .governor
                    .local_media()
                    .map(|s| s.has_video())
                    .unwrap_or(false);
                if let Some(stream) = self.governor.local_media() {
                    if let Some(track) = &stream.video {
                        track.set_enabled(enabled);
                    }
                }
                self.local.video_enabled = enabled && has_video;
                self.send_privacy_update().await;
                self.emit_participants().await;
            }
            SessionCommand::SendFile(file) => self.start_file_send(file).await,
            SessionCommand::CancelFileTransfer => {
                if !self.governor.cancel_transfer() {
                    debug!("no outbound transfer to cancel");
                }
            }
            SessionCommand::Renegotiate => self.renegotiate().await,
            SessionCommand::VisibilityChanged { visible } => {
                if visible && self.state != SessionState::Connected && self.role.is_some() {
                    self.schedule_reconnect(ReconnectReason::Visibility);
                }
            }
            SessionCommand::Exit => {
                if self.channel_open() {
                    // Deliver the notice before the channel goes down.
                    self.send_frame(Frame::SessionTerminate {}).await;
                    tokio::time::sleep(TERMINATE_FLUSH).await;
                }
                self.terminate().await;
            }
        }
    }

    async fn start_file_send(&mut self, file: OutgoingFile) {
        let id = Uuid::new_v4();
        if self.governor.transfer_active() {
            self.emit(SessionEvent::FileFailed {
                id,
                direction: TransferDirection::Outbound,
                reason: "another transfer is already in progress".into(),
            })
            .await;
            return;
        }
        if let Err(e) = transfer::ensure_sendable(file.bytes.len() as u64) {
            self.emit(SessionEvent::FileFailed {
                id,
                direction: TransferDirection::Outbound,
                reason: e.to_string(),
            })
            .await;
            return;
        }
        let transport = match self.governor.transport() {
            Some(t) if t.is_channel_open() => t.clone(),
            _ => {
                self.emit(SessionEvent::FileFailed {
                    id,
                    direction: TransferDirection::Outbound,
                    reason: "not connected".into(),
                })
                .await;
                return;
            }
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let key = self.key.clone();
        let events = self.events.clone();
        let notes = self.notes.clone();
        let task = tokio::spawn(async move {
            let result =
                transfer::send_file(transport.as_ref(), &key, id, &file, &token, &events).await;
            let _ = notes.send(InternalNote::TransferFinished { id, result }).await;
        });
        self.governor.begin_transfer(ActiveTransfer { id, cancel, task });
    }

    async fn renegotiate(&mut self) {
        // Honored only by the initiator, only in a stable negotiation
        // state, at most once per throttle window.
        if self.role != Some(PeerRole::Initiator) {
            debug!("renegotiation ignored: not the initiator");
            return;
        }
        let Some(transport) = self.governor.transport().cloned() else {
            return;
        };
        if !transport.is_stable() {
            debug!("renegotiation ignored: negotiation not stable");
            return;
        }
        let now = Instant::now();
        if self
            .last_negotiation
            .is_some_and(|t| now.duration_since(t) < NEGOTIATION_THROTTLE)
        {
            debug!("renegotiation throttled");
            return;
        }
        self.last_negotiation = Some(now);

        match transport.create_offer().await {
            Ok(offer) => {
                match handshake_rpc(self.store.publish_offer(
                    &self.config.room,
                    self.peer_id,
                    &offer,
                ))
                .await
                {
                    Ok(true) => {
                        // Publishing clears the stale answer column; arm
                        // the guard so the peer's fresh answer is applied
                        // exactly once.
                        self.guards.processed_answer = false;
                        debug!("renegotiation offer published");
                    }
                    Ok(false) => warn!("renegotiation offer matched no row"),
                    Err(e) => warn!(error = %e, "renegotiation offer publish failed"),
                }
            }
            Err(e) => warn!(error = %e, "renegotiation offer failed"),
        }
    }

    async fn handle_note(&mut self, note: InternalNote) {
        match note {
            InternalNote::TransferFinished { id, result } => {
                self.governor.finish_transfer(id);
                match result {
                    Ok(()) => self.emit(SessionEvent::FileSent { id }).await,
                    Err(e) => {
                        self.emit(SessionEvent::FileFailed {
                            id,
                            direction: TransferDirection::Outbound,
                            reason: e.to_string(),
                        })
                        .await
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn heartbeat_tick(&mut self) {
        if self.finished || self.state.is_terminal() || !self.occupies_slot {
            return;
        }
        let refreshed = match self.store.touch(&self.config.room, self.peer_id).await {
            Ok(matched) => matched,
            Err(e) => {
                debug!(error = %e, "heartbeat write failed");
                false
            }
        };
        if refreshed {
            self.heartbeat_failures = 0;
            return;
        }
        self.heartbeat_failures += 1;
        warn!(failures = self.heartbeat_failures, "heartbeat failed");
        if self.heartbeat_failures >= HEARTBEAT_FAILURE_LIMIT
            && self.state == SessionState::Connected
        {
            self.heartbeat_failures = 0;
            self.emit(SessionEvent::Warning(
                "lost contact with the rendezvous service".into(),
            ))
            .await;
            self.schedule_reconnect(ReconnectReason::HeartbeatFailure);
        }
    }
}
