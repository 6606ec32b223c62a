use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use voile_shared::types::{PeerId, RoomId};

use crate::record::SignalRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("rendezvous backend error: {0}")]
    Backend(String),

    #[error("change feed closed")]
    SubscriptionClosed,
}

/// Change notification for a single room. The bus may deliver the same
/// update more than once; consumers guard with single-shot flags or the
/// conditional-update matched signal.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Inserted(SignalRecord),
    Updated(SignalRecord),
    Deleted,
}

/// Live change-notification feed for one room.
pub struct RoomSubscription {
    rx: broadcast::Receiver<RoomEvent>,
}

impl RoomSubscription {
    pub fn new(rx: broadcast::Receiver<RoomEvent>) -> Self {
        Self { rx }
    }

    /// Next change event, or `None` once the feed is gone. A lagged
    /// receiver skips ahead rather than erroring: the signaling machine
    /// re-reads the row anyway.
    pub async fn next(&mut self) -> Option<RoomEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change feed lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Typed façade over the eventually-consistent rendezvous store.
///
/// Conditional operations return whether the update actually matched a
/// row; zero-rows-affected (`false`) is the "lost the race" signal. No
/// other atomicity is assumed.
#[async_trait]
pub trait SignalStore: Send + Sync + 'static {
    /// Read the record for a room, if any.
    async fn fetch(&self, room: &RoomId) -> Result<Option<SignalRecord>, StoreError>;

    /// Insert the record only if the room has none. `false` on collision.
    async fn insert_if_absent(&self, record: SignalRecord) -> Result<bool, StoreError>;

    /// Write the real offer and clear any stale answer, predicated on
    /// `initiator_id` still being `initiator`. A renegotiation re-runs
    /// this on the occupied row.
    async fn publish_offer(
        &self,
        room: &RoomId,
        initiator: PeerId,
        offer: &str,
    ) -> Result<bool, StoreError>;

    /// Claim the receiver slot and write the answer, predicated on
    /// `receiver_id` being null. Set at most once per record lifetime.
    async fn claim_receiver(
        &self,
        room: &RoomId,
        receiver: PeerId,
        answer: &str,
    ) -> Result<bool, StoreError>;

    /// Re-write the answer column, predicated on `receiver_id` being
    /// `receiver`. Used when answering a renegotiated offer; the slot
    /// itself is never re-claimed.
    async fn write_answer(
        &self,
        room: &RoomId,
        receiver: PeerId,
        answer: &str,
    ) -> Result<bool, StoreError>;

    /// Heartbeat: refresh `updated_at` by re-writing the occupant's own
    /// role column. `false` when `occupant` no longer occupies the row.
    async fn touch(&self, room: &RoomId, occupant: PeerId) -> Result<bool, StoreError>;

    /// Delete the record for a room. Deleting an absent room is not an
    /// error.
    async fn delete(&self, room: &RoomId) -> Result<(), StoreError>;

    /// Subscribe to insert/update/delete notifications for one room.
    /// Callers subscribe before (or concurrently with) their first read
    /// so transitions during handshake are not missed.
    async fn subscribe(&self, room: &RoomId) -> Result<RoomSubscription, StoreError>;
}
