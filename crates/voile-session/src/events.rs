//! Command and event vocabulary between the embedder and the session
//! task. Commands flow in over the handle's mpsc sender; events flow
//! out over the receiver returned by `spawn_session`.

use bytes::Bytes;
use uuid::Uuid;

use voile_shared::error::SessionFault;
use voile_shared::types::PrivacyMode;

use crate::participant::ParticipantView;
use crate::signaling::SessionState;
use crate::transfer::ReceivedFile;

/// A file handed to the session for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Commands sent *into* the session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Encrypt and send a chat message.
    SendChat(String),
    /// Switch the local privacy mode and mirror it to the peer.
    SetPrivacy(PrivacyMode),
    /// Toggle the local audio track (mute).
    SetMuted(bool),
    /// Toggle the local video track.
    SetVideoEnabled(bool),
    /// Begin a file transfer. One outbound transfer at a time.
    SendFile(OutgoingFile),
    /// Cancel the in-flight outbound transfer, if any.
    CancelFileTransfer,
    /// Request renegotiation (honored only by the initiator, throttled).
    Renegotiate,
    /// Tab visibility changed; becoming visible while disconnected
    /// schedules a reconnect.
    VisibilityChanged { visible: bool },
    /// Orderly teardown: notify the peer, then clean up.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

/// Notifications sent *from* the session task to the embedder.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    ParticipantsChanged(ParticipantView),
    /// A decrypted chat message from the peer.
    ChatReceived(String),
    /// The peer's privacy mode or mute/video flags changed.
    PeerPrivacyChanged {
        filter: PrivacyMode,
        audio_enabled: bool,
        video_enabled: bool,
    },
    /// The peer declared an incoming file.
    FileOffered {
        id: Uuid,
        name: String,
        size: u64,
        mime_type: String,
    },
    FileProgress {
        id: Uuid,
        direction: TransferDirection,
        transferred: u64,
        total: u64,
    },
    /// An inbound file assembled and verified; the blob is ready for
    /// download by the application layer.
    FileReceived(ReceivedFile),
    /// The outbound transfer completed.
    FileSent { id: Uuid },
    FileFailed {
        id: Uuid,
        direction: TransferDirection,
        reason: String,
    },
    /// Non-terminal trouble the user should see (connection lost,
    /// passphrase mismatch, heartbeat failures).
    Warning(String),
    /// One of the three terminal faults. The session is over.
    Fault(SessionFault),
    /// Orderly end of session, local or peer-requested.
    Terminated,
}
