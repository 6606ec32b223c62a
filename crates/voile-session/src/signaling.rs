//! Role election and the signaling state vocabulary.
//!
//! Election runs against the shared room record using only atomic
//! conditional operations: every transition tolerates losing a race and
//! restarts, up to the attempt limit. The session event loop drives the
//! surrounding handshakes.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use voile_rendezvous::{SignalRecord, SignalStore, StoreError};
use voile_shared::constants::{
    ELECTION_ATTEMPTS, ELECTION_RETRY_BACKOFF, RECONNECT_DELAY, RECONNECT_DELAY_RACE,
    RECONNECT_DELAY_VISIBILITY,
};
use voile_shared::types::{PeerId, RoomId};

/// Observable session lifecycle. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Ready,
    Connected,
    SecurityError,
    MediaError,
    RoomFull,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::SecurityError | SessionState::MediaError | SessionState::RoomFull
        )
    }
}

/// Single-shot guards for exactly-once application of remote
/// descriptions, plus the reentry guard for the signaling procedure.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandshakeGuards {
    pub signaling_in_progress: bool,
    pub processed_offer: bool,
    pub processed_answer: bool,
}

impl HandshakeGuards {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    ConnectionLost,
    HeartbeatFailure,
    Visibility,
    SignalingRace,
    StoreTrouble,
}

impl ReconnectReason {
    pub fn delay(self) -> Duration {
        match self {
            ReconnectReason::Visibility => RECONNECT_DELAY_VISIBILITY,
            ReconnectReason::SignalingRace => RECONNECT_DELAY_RACE,
            _ => RECONNECT_DELAY,
        }
    }
}

#[derive(Debug)]
pub enum ElectionOutcome {
    /// We inserted the record; proceed with the initiator handshake.
    Initiator,
    /// A real offer is already published; proceed as receiver.
    Receiver { offer: String },
    /// The initiator slot is taken but the offer column still holds the
    /// claim sentinel: wait for the change notification with the offer.
    AwaitOffer,
    /// Both slots taken by live peers.
    RoomFull,
    /// The record's passphrase fingerprint does not match ours.
    PassphraseMismatch,
    /// Attempts exhausted without a stable outcome; retry shortly.
    Exhausted,
}

/// One pass of the role election procedure.
pub async fn elect_role(
    store: &dyn SignalStore,
    room: &RoomId,
    self_id: PeerId,
    fingerprint: &str,
) -> Result<ElectionOutcome, StoreError> {
    for attempt in 1..=ELECTION_ATTEMPTS {
        if attempt > 1 {
            debug!(attempt, room = %room, "restarting role election");
        }

        match fetch_with_retry(store, room).await? {
            None => {
                let record =
                    SignalRecord::claim(room.clone(), self_id, fingerprint.to_string());
                if store.insert_if_absent(record).await? {
                    return Ok(ElectionOutcome::Initiator);
                }
                // Someone inserted between our read and our write.
                continue;
            }
            Some(row) if row.is_fully_occupied() => {
                let now = Utc::now();
                let reclaimable = if row.has_occupant(self_id) {
                    row.expired_for_occupant(now)
                } else {
                    row.reclaimable_by_stranger(now)
                };
                if reclaimable {
                    warn!(room = %room, "reclaiming stale room record");
                    store.delete(room).await?;
                    continue;
                }
                return Ok(ElectionOutcome::RoomFull);
            }
            Some(row) => {
                if row.initiator_id == self_id {
                    // Our own abandoned claim from an earlier attempt in
                    // this tab; release it and start over.
                    store.delete(room).await?;
                    continue;
                }
                if row.passphrase_hash != fingerprint {
                    return Ok(ElectionOutcome::PassphraseMismatch);
                }
                return match row.real_offer() {
                    Some(offer) => Ok(ElectionOutcome::Receiver {
                        offer: offer.to_string(),
                    }),
                    None => Ok(ElectionOutcome::AwaitOffer),
                };
            }
        }
    }
    Ok(ElectionOutcome::Exhausted)
}

/// Read the row, retrying transient backend failures with a short
/// back-off before giving up on this election pass.
async fn fetch_with_retry(
    store: &dyn SignalStore,
    room: &RoomId,
) -> Result<Option<SignalRecord>, StoreError> {
    let mut last = StoreError::Backend("rendezvous read failed".into());
    for attempt in 0..ELECTION_ATTEMPTS {
        match store.fetch(room).await {
            Ok(row) => return Ok(row),
            Err(e) => {
                warn!(error = %e, attempt, "rendezvous read failed");
                last = e;
                tokio::time::sleep(ELECTION_RETRY_BACKOFF * (attempt + 1)).await;
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use voile_rendezvous::MemoryStore;

    const FP: &str = "fingerprint";

    fn room() -> RoomId {
        RoomId::new("BETA-2")
    }

    async fn seed(store: &MemoryStore, record: SignalRecord) {
        assert!(store.insert_if_absent(record).await.unwrap());
    }

    fn aged(mut record: SignalRecord, age_ms: i64) -> SignalRecord {
        record.updated_at = Utc::now() - ChronoDuration::milliseconds(age_ms);
        record
    }

    #[tokio::test]
    async fn test_empty_room_elects_initiator_with_sentinel() {
        let store = MemoryStore::new();
        let me = PeerId::generate();

        let outcome = elect_role(&store, &room(), me, FP).await.unwrap();
        assert!(matches!(outcome, ElectionOutcome::Initiator));

        let row = store.fetch(&room()).await.unwrap().unwrap();
        assert_eq!(row.initiator_id, me);
        assert!(row.offer_is_claimed());
    }

    #[tokio::test]
    async fn test_published_offer_elects_receiver() {
        let store = MemoryStore::new();
        let initiator = PeerId::generate();
        seed(&store, SignalRecord::claim(room(), initiator, FP.into())).await;
        store.publish_offer(&room(), initiator, "b64-offer").await.unwrap();

        let outcome = elect_role(&store, &room(), PeerId::generate(), FP)
            .await
            .unwrap();
        match outcome {
            ElectionOutcome::Receiver { offer } => assert_eq!(offer, "b64-offer"),
            other => panic!("expected receiver, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_claim_sentinel_means_wait() {
        let store = MemoryStore::new();
        seed(
            &store,
            SignalRecord::claim(room(), PeerId::generate(), FP.into()),
        )
        .await;

        let outcome = elect_role(&store, &room(), PeerId::generate(), FP)
            .await
            .unwrap();
        assert!(matches!(outcome, ElectionOutcome::AwaitOffer));
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_surfaced() {
        let store = MemoryStore::new();
        seed(
            &store,
            SignalRecord::claim(room(), PeerId::generate(), "other".into()),
        )
        .await;

        let outcome = elect_role(&store, &room(), PeerId::generate(), FP)
            .await
            .unwrap();
        assert!(matches!(outcome, ElectionOutcome::PassphraseMismatch));
    }

    #[tokio::test]
    async fn test_fresh_full_room_is_full() {
        let store = MemoryStore::new();
        let mut record = SignalRecord::claim(room(), PeerId::generate(), FP.into());
        record.receiver_id = Some(PeerId::generate());
        seed(&store, record).await;

        let outcome = elect_role(&store, &room(), PeerId::generate(), FP)
            .await
            .unwrap();
        assert!(matches!(outcome, ElectionOutcome::RoomFull));
    }

    #[tokio::test]
    async fn test_own_stale_full_room_is_reclaimed() {
        let store = MemoryStore::new();
        let me = PeerId::generate();
        let mut record = SignalRecord::claim(room(), PeerId::generate(), FP.into());
        record.receiver_id = Some(me);
        seed(&store, aged(record, 10_000)).await;

        // 10 s stale and self is an occupant: delete, restart, claim.
        let outcome = elect_role(&store, &room(), me, FP).await.unwrap();
        assert!(matches!(outcome, ElectionOutcome::Initiator));
        let row = store.fetch(&room()).await.unwrap().unwrap();
        assert_eq!(row.initiator_id, me);
    }

    #[tokio::test]
    async fn test_stranger_needs_longer_horizon() {
        let store = MemoryStore::new();
        let mut record = SignalRecord::claim(room(), PeerId::generate(), FP.into());
        record.receiver_id = Some(PeerId::generate());
        seed(&store, aged(record.clone(), 10_000)).await;

        // 10 s is past the occupant horizon but not the stranger one.
        let outcome = elect_role(&store, &room(), PeerId::generate(), FP)
            .await
            .unwrap();
        assert!(matches!(outcome, ElectionOutcome::RoomFull));

        store.delete(&room()).await.unwrap();
        seed(&store, aged(record, 13_000)).await;
        let outcome = elect_role(&store, &room(), PeerId::generate(), FP)
            .await
            .unwrap();
        assert!(matches!(outcome, ElectionOutcome::Initiator));
    }

    #[tokio::test]
    async fn test_own_abandoned_initiator_claim_is_released() {
        let store = MemoryStore::new();
        let me = PeerId::generate();
        seed(&store, SignalRecord::claim(room(), me, FP.into())).await;

        let outcome = elect_role(&store, &room(), me, FP).await.unwrap();
        assert!(matches!(outcome, ElectionOutcome::Initiator));
        // The row was re-created, not joined as receiver.
        let row = store.fetch(&room()).await.unwrap().unwrap();
        assert!(row.offer_is_claimed());
        assert!(row.receiver_id.is_none());
    }
}
