use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("strong cryptographic primitives are unavailable in this context")]
    InsecureContext,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("authentication failed: invalid ciphertext or wrong key")]
    AuthenticationFailure,

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link carries no room identifier")]
    MissingRoom,

    #[error("link carries no passphrase")]
    MissingPassphrase,

    #[error("malformed link fragment")]
    InvalidFormat,
}

/// The three terminal session faults. Everything else is logged and
/// handled internally.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFault {
    #[error("secure context required")]
    SecurityError,

    #[error("camera/microphone unavailable")]
    MediaError,

    #[error("room is full")]
    RoomFull,
}
