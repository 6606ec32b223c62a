use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use voile_shared::types::{PeerId, RoomId};

use crate::record::SignalRecord;
use crate::store::{RoomEvent, RoomSubscription, SignalStore, StoreError};

const CHANGE_FEED_CAPACITY: usize = 64;

struct Shared {
    rooms: HashMap<RoomId, SignalRecord>,
    feeds: HashMap<RoomId, broadcast::Sender<RoomEvent>>,
}

/// In-process reference implementation of [`SignalStore`], used by the
/// test suites and the demo binary. Rows live in a mutexed map; change
/// notifications ride a per-room broadcast channel.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                rooms: HashMap::new(),
                feeds: HashMap::new(),
            })),
        }
    }

    fn with_shared<T>(&self, f: impl FnOnce(&mut Shared) -> T) -> Result<T, StoreError> {
        let mut guard = self
            .shared
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))?;
        Ok(f(&mut guard))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(shared: &mut Shared, room: &RoomId, event: RoomEvent) {
    if let Some(feed) = shared.feeds.get(room) {
        // No subscribers is fine; the send result only reports that.
        let _ = feed.send(event);
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn fetch(&self, room: &RoomId) -> Result<Option<SignalRecord>, StoreError> {
        self.with_shared(|shared| shared.rooms.get(room).cloned())
    }

    async fn insert_if_absent(&self, record: SignalRecord) -> Result<bool, StoreError> {
        self.with_shared(|shared| {
            let room = record.room_id.clone();
            if shared.rooms.contains_key(&room) {
                return false;
            }
            shared.rooms.insert(room.clone(), record.clone());
            debug!(room = %room, initiator = %record.initiator_id.short(), "room record inserted");
            notify(shared, &room, RoomEvent::Inserted(record));
            true
        })
    }

    async fn publish_offer(
        &self,
        room: &RoomId,
        initiator: PeerId,
        offer: &str,
    ) -> Result<bool, StoreError> {
        self.with_shared(|shared| {
            let Some(record) = shared.rooms.get_mut(room) else {
                return false;
            };
            if record.initiator_id != initiator {
                return false;
            }
            record.offer = Some(offer.to_string());
            // A new offer invalidates whatever answer was paired with
            // the previous one.
            record.answer = None;
            record.updated_at = Utc::now();
            let snapshot = record.clone();
            notify(shared, room, RoomEvent::Updated(snapshot));
            true
        })
    }

    async fn claim_receiver(
        &self,
        room: &RoomId,
        receiver: PeerId,
        answer: &str,
    ) -> Result<bool, StoreError> {
        self.with_shared(|shared| {
            let Some(record) = shared.rooms.get_mut(room) else {
                return false;
            };
            // The conditional predicate: the slot must still be empty.
            if record.receiver_id.is_some() {
                return false;
            }
            record.receiver_id = Some(receiver);
            record.answer = Some(answer.to_string());
            record.updated_at = Utc::now();
            let snapshot = record.clone();
            debug!(room = %room, receiver = %receiver.short(), "receiver slot claimed");
            notify(shared, room, RoomEvent::Updated(snapshot));
            true
        })
    }

    async fn write_answer(
        &self,
        room: &RoomId,
        receiver: PeerId,
        answer: &str,
    ) -> Result<bool, StoreError> {
        self.with_shared(|shared| {
            let Some(record) = shared.rooms.get_mut(room) else {
                return false;
            };
            if record.receiver_id != Some(receiver) {
                return false;
            }
            record.answer = Some(answer.to_string());
            record.updated_at = Utc::now();
            let snapshot = record.clone();
            notify(shared, room, RoomEvent::Updated(snapshot));
            true
        })
    }

    async fn touch(&self, room: &RoomId, occupant: PeerId) -> Result<bool, StoreError> {
        self.with_shared(|shared| {
            let Some(record) = shared.rooms.get_mut(room) else {
                return false;
            };
            if !record.has_occupant(occupant) {
                return false;
            }
            record.updated_at = Utc::now();
            let snapshot = record.clone();
            notify(shared, room, RoomEvent::Updated(snapshot));
            true
        })
    }

    async fn delete(&self, room: &RoomId) -> Result<(), StoreError> {
        self.with_shared(|shared| {
            if shared.rooms.remove(room).is_some() {
                debug!(room = %room, "room record deleted");
                notify(shared, room, RoomEvent::Deleted);
            }
        })
    }

    async fn subscribe(&self, room: &RoomId) -> Result<RoomSubscription, StoreError> {
        self.with_shared(|shared| {
            let feed = shared
                .feeds
                .entry(room.clone())
                .or_insert_with(|| broadcast::channel(CHANGE_FEED_CAPACITY).0);
            RoomSubscription::new(feed.subscribe())
        })
    }
}
