//! Typed access to the rendezvous service's single signaling record:
//! fetch, insert-if-absent, conditional updates that report whether they
//! matched, delete, and per-room change notifications.

pub mod memory;
pub mod record;
pub mod store;

pub use memory::MemoryStore;
pub use record::SignalRecord;
pub use store::{RoomEvent, RoomSubscription, SignalStore, StoreError};
