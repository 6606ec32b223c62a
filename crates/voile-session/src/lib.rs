//! Voile session core: brokers exactly two peers through a shared room
//! record into a direct encrypted data channel, and carries chat,
//! privacy-state sync and file transfer over it.

pub mod events;
pub mod governor;
pub mod media;
pub mod participant;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use events::{OutgoingFile, SessionCommand, SessionEvent, TransferDirection};
pub use media::{MediaError, MediaPipeline, MediaStream, MediaTrack, SyntheticPipeline, TrackKind};
pub use participant::{Participant, ParticipantView};
pub use session::{spawn_session, SessionClosed, SessionConfig, SessionHandle};
pub use signaling::SessionState;
pub use transfer::ReceivedFile;
pub use transport::{IceServer, TransportConfig};
