use std::time::Duration;

/// Plaintext chunk size for file transfers (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Data-channel buffered-amount ceiling; the sender pauses above this (1 MiB).
pub const BUFFER_HIGH_WATER: usize = 1024 * 1024;

/// Low-water mark at which a paused sender resumes.
pub const BUFFER_LOW_WATER: usize = BUFFER_HIGH_WATER / 2;

/// Maximum file size accepted for transfer (100 MiB).
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// AEAD nonce size in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// PBKDF2-HMAC-SHA256 iteration count for session key derivation.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Heartbeat period while occupying a room slot.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive heartbeat failures tolerated while connected.
pub const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Hard cap on ICE gathering before the local description is committed.
pub const GATHERING_TIMEOUT: Duration = Duration::from_secs(4);

/// Timeout for a single handshake RPC against the rendezvous store.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

/// Age at which a room record occupied by self is considered abandoned.
pub const SESSION_EXPIRY_HORIZON: Duration = Duration::from_secs(8);

/// Age at which any peer may reclaim a fully occupied room record.
pub const ROOM_FULL_HORIZON: Duration = Duration::from_secs(12);

/// Minimum spacing between initiator-driven renegotiations.
pub const NEGOTIATION_THROTTLE: Duration = Duration::from_secs(5);

/// Reconnect delay after a lost connection or failed heartbeat.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnect delay when the tab becomes visible again.
pub const RECONNECT_DELAY_VISIBILITY: Duration = Duration::from_millis(500);

/// Reconnect delay after losing a signaling race.
pub const RECONNECT_DELAY_RACE: Duration = Duration::from_millis(300);

/// Role election attempts before the machine backs off.
pub const ELECTION_ATTEMPTS: u32 = 3;

/// Back-off between retries of a failed rendezvous RPC.
pub const ELECTION_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Sentinel stored in the offer column while the initiator computes the
/// real offer.
pub const OFFER_CLAIMED_SENTINEL: &str = "CLAIMED";

/// Label of the single ordered data channel.
pub const DATA_CHANNEL_LABEL: &str = "voile";

/// Public STUN server used for candidate discovery.
pub const STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Always-available TURN relay for restrictive networks.
pub const TURN_URL: &str = "turn:openrelay.metered.ca:80";
pub const TURN_USERNAME: &str = "openrelayproject";
pub const TURN_CREDENTIAL: &str = "openrelayproject";
