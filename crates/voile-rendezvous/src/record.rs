use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use voile_shared::constants::{
    OFFER_CLAIMED_SENTINEL, ROOM_FULL_HORIZON, SESSION_EXPIRY_HORIZON,
};
use voile_shared::types::{PeerId, RoomId};

/// The single shared row that mediates one session. At most one record
/// exists per room; it is created only by a peer entering the initiator
/// role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalRecord {
    pub room_id: RoomId,
    pub passphrase_hash: String,
    pub initiator_id: PeerId,
    pub receiver_id: Option<PeerId>,
    /// Base64-encoded session description, or [`OFFER_CLAIMED_SENTINEL`]
    /// while the initiator is still computing the real offer.
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignalRecord {
    /// The record written by a fresh initiator claim: the offer column
    /// holds the sentinel until gathering commits the real offer.
    pub fn claim(room_id: RoomId, initiator_id: PeerId, passphrase_hash: String) -> Self {
        let now = Utc::now();
        Self {
            room_id,
            passphrase_hash,
            initiator_id,
            receiver_id: None,
            offer: Some(OFFER_CLAIMED_SENTINEL.to_string()),
            answer: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_fully_occupied(&self) -> bool {
        self.receiver_id.is_some()
    }

    pub fn has_occupant(&self, peer: PeerId) -> bool {
        self.initiator_id == peer || self.receiver_id == Some(peer)
    }

    pub fn offer_is_claimed(&self) -> bool {
        self.offer.as_deref() == Some(OFFER_CLAIMED_SENTINEL)
    }

    /// The offer column, with the claim sentinel filtered out.
    pub fn real_offer(&self) -> Option<&str> {
        self.offer
            .as_deref()
            .filter(|o| *o != OFFER_CLAIMED_SENTINEL)
    }

    fn is_stale(&self, horizon: std::time::Duration, now: DateTime<Utc>) -> bool {
        let horizon = Duration::from_std(horizon).unwrap_or(Duration::MAX);
        now - self.updated_at >= horizon
    }

    /// An occupant's own record past the session-expiry horizon is
    /// abandoned and may be self-reclaimed.
    pub fn expired_for_occupant(&self, now: DateTime<Utc>) -> bool {
        self.is_stale(SESSION_EXPIRY_HORIZON, now)
    }

    /// A fully occupied record past the room-full horizon may be
    /// reclaimed by any third party.
    pub fn reclaimable_by_stranger(&self, now: DateTime<Utc>) -> bool {
        self.is_stale(ROOM_FULL_HORIZON, now)
    }
}
