use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::{KDF_ITERATIONS, NONCE_SIZE};
use crate::error::CryptoError;
use crate::types::RoomId;

/// Opaque handle over the symmetric session key. Derived once per
/// session, held only in memory, never serialized.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; 32],
}

impl SessionKey {
    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.key).into())
    }
}

// Keys never appear in logs or panics.
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key from the passphrase, with the room identifier
/// as salt. PBKDF2-HMAC-SHA256, 100,000 iterations, 256-bit output.
///
/// Fails with [`CryptoError::InsecureContext`] when the OS entropy
/// source cannot be read, since every later encrypt call depends on it.
pub fn derive_session_key(passphrase: &str, room: &RoomId) -> Result<SessionKey, CryptoError> {
    let mut probe = [0u8; 1];
    OsRng
        .try_fill_bytes(&mut probe)
        .map_err(|_| CryptoError::InsecureContext)?;

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        room.as_str().as_bytes(),
        KDF_ITERATIONS,
        &mut key,
    );
    Ok(SessionKey { key })
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt a UTF-8 string. Returns `(ciphertext_b64, iv_b64)` with a
/// fresh 96-bit nonce per call.
pub fn encrypt_text(key: &SessionKey, text: &str) -> Result<(String, String), CryptoError> {
    let (ciphertext, iv) = encrypt_bytes(key, text.as_bytes())?;
    Ok((STANDARD.encode(ciphertext), STANDARD.encode(iv)))
}

/// Decrypt a `(ciphertext_b64, iv_b64)` pair produced by [`encrypt_text`].
pub fn decrypt_text(key: &SessionKey, data_b64: &str, iv_b64: &str) -> Result<String, CryptoError> {
    let ciphertext = STANDARD
        .decode(data_b64)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let iv = STANDARD
        .decode(iv_b64)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let plaintext = decrypt_bytes(key, &ciphertext, &iv)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

/// Encrypt a byte buffer. Returns `(ciphertext, iv)`.
pub fn encrypt_bytes(
    key: &SessionKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let iv = generate_nonce();
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok((ciphertext, iv))
}

/// Decrypt a byte buffer. Fails with [`CryptoError::AuthenticationFailure`]
/// on tag mismatch.
pub fn decrypt_bytes(key: &SessionKey, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidEncoding(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    key.cipher()
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

/// Base64 SHA-256 digest of the passphrase, stored in the signaling
/// record as a cheap mismatch check. Not a security boundary: the real
/// check is that ciphertexts fail to authenticate under a wrong key.
pub fn fingerprint(passphrase: &str) -> String {
    STANDARD.encode(Sha256::digest(passphrase.as_bytes()))
}
