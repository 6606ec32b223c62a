//! Resource governor: centralized tracking of every long-lived handle a
//! session acquires, with a single idempotent cleanup path.
//!
//! The peer connection holds handlers that close over session state and
//! the session holds the peer connection; cleanup breaks that cycle by
//! explicitly nulling handler slots before closing, never by relying on
//! scope collection.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use voile_rendezvous::RoomSubscription;

use crate::media::MediaStream;
use crate::transfer::ReceivedFile;
use crate::transport::TransportSession;

/// The one in-flight outbound transfer.
pub struct ActiveTransfer {
    pub id: Uuid,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

#[derive(Default)]
pub struct ResourceGovernor {
    transport: Option<Arc<TransportSession>>,
    pub subscription: Option<RoomSubscription>,
    local_media: Option<MediaStream>,
    received_files: Vec<ReceivedFile>,
    transfer: Option<ActiveTransfer>,
}

impl ResourceGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a freshly built transport. Cleanup must have released the
    /// previous one first.
    pub fn set_transport(&mut self, transport: Arc<TransportSession>) {
        debug_assert!(self.transport.is_none(), "transport replaced without cleanup");
        self.transport = Some(transport);
    }

    pub fn transport(&self) -> Option<&Arc<TransportSession>> {
        self.transport.as_ref()
    }

    pub fn set_local_media(&mut self, stream: MediaStream) {
        self.local_media = Some(stream);
    }

    pub fn local_media(&self) -> Option<&MediaStream> {
        self.local_media.as_ref()
    }

    /// Track a file handed to the application layer; dropped on cleanup,
    /// mirroring blob-URL revocation.
    pub fn register_received_file(&mut self, file: ReceivedFile) {
        self.received_files.push(file);
    }

    pub fn begin_transfer(&mut self, transfer: ActiveTransfer) {
        debug_assert!(self.transfer.is_none(), "second concurrent outbound transfer");
        self.transfer = Some(transfer);
    }

    pub fn transfer_active(&self) -> bool {
        self.transfer.is_some()
    }

    /// Fire the cancellation token of the in-flight transfer, if any.
    /// The transfer task observes it at the next chunk boundary.
    pub fn cancel_transfer(&mut self) -> bool {
        match &self.transfer {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a transfer whose task has reported completion.
    pub fn finish_transfer(&mut self, id: Uuid) {
        if self.transfer.as_ref().is_some_and(|t| t.id == id) {
            self.transfer = None;
        }
    }

    /// Release everything. Safe to call repeatedly; after it returns no
    /// background activity remains and a new transport may be built.
    pub async fn cleanup(&mut self) {
        if let Some(active) = self.transfer.take() {
            active.cancel.cancel();
            active.task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }
        if let Some(stream) = self.local_media.take() {
            stream.stop();
        }
        self.received_files.clear();
        self.subscription = None;
        debug!("session resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};

    fn parked_transfer() -> ActiveTransfer {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { token.cancelled().await });
        ActiveTransfer {
            id: Uuid::new_v4(),
            cancel,
            task,
        }
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let mut governor = ResourceGovernor::new();
        let track = MediaTrack::new(TrackKind::Audio);
        governor.set_local_media(MediaStream {
            audio: Some(track.clone()),
            video: None,
        });
        governor.begin_transfer(parked_transfer());

        governor.cleanup().await;
        assert!(track.is_stopped());
        assert!(!governor.transfer_active());
        assert!(governor.local_media().is_none());

        // Second call has no further visible effect.
        governor.cleanup().await;
        assert!(governor.local_media().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_cancels_transfer_token() {
        let mut governor = ResourceGovernor::new();
        let transfer = parked_transfer();
        let token = transfer.cancel.clone();
        governor.begin_transfer(transfer);

        governor.cleanup().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_leaves_transfer_tracked_until_finished() {
        let mut governor = ResourceGovernor::new();
        let transfer = parked_transfer();
        let id = transfer.id;
        governor.begin_transfer(transfer);

        assert!(governor.cancel_transfer());
        assert!(governor.transfer_active());
        governor.finish_transfer(id);
        assert!(!governor.transfer_active());
        assert!(!governor.cancel_transfer());
    }
}
