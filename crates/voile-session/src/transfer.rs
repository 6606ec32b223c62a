//! File transfer engine: chunked, encrypted, backpressure-aware send;
//! assembly and integrity check on receive; cancellation.
//!
//! On the wire a chunk is a single binary frame `nonce[12] ‖ ciphertext`
//! with a fresh nonce per chunk. The sender pauses while the channel's
//! buffered amount would exceed the high-water mark and resumes from the
//! low-water callback.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use voile_shared::constants::{BUFFER_HIGH_WATER, CHUNK_SIZE, MAX_FILE_SIZE, NONCE_SIZE};
use voile_shared::crypto::{self, SessionKey};
use voile_shared::error::CryptoError;
use voile_shared::protocol::Frame;

use crate::events::{OutgoingFile, SessionEvent, TransferDirection};

/// How long a paused sender waits before re-checking the buffered
/// amount, in case a low-water wakeup was missed.
const BACKPRESSURE_RECHECK: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("file of {0} bytes exceeds the transfer limit")]
    TooLarge(u64),

    #[error("transfer canceled")]
    Canceled,

    #[error("data channel closed mid-transfer")]
    ChannelClosed,

    #[error("malformed chunk frame")]
    BadFrame,

    #[error("chunk exceeds the declared file size")]
    Overrun,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("channel error: {0}")]
    Channel(String),
}

/// The slice of the data channel the engine needs. The live
/// implementation is the transport session; tests substitute a fake to
/// pin the buffered amount.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransferError>;
    async fn send_chunk(&self, chunk: Bytes) -> Result<(), TransferError>;
    async fn buffered_amount(&self) -> usize;
    /// Resolves on the next low-water-mark callback.
    async fn buffered_low(&self);
    fn is_open(&self) -> bool;
}

/// Reject oversized files locally, before any frame is sent.
pub fn ensure_sendable(len: u64) -> Result<(), TransferError> {
    if len > MAX_FILE_SIZE {
        return Err(TransferError::TooLarge(len));
    }
    Ok(())
}

/// Stream one file over the sink. Emits `file-meta`, then the encrypted
/// chunks, honoring the cancellation token at every chunk boundary.
/// Channel closure mid-transfer is treated as cancellation.
pub async fn send_file(
    sink: &dyn ChunkSink,
    key: &SessionKey,
    id: Uuid,
    file: &OutgoingFile,
    cancel: &CancellationToken,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), TransferError> {
    let total = file.bytes.len() as u64;
    ensure_sendable(total)?;

    sink.send_frame(&Frame::FileMeta {
        id,
        name: file.name.clone(),
        size: total,
        mime_type: file.mime_type.clone(),
    })
    .await?;

    debug!(id = %id, name = %file.name, size = total, "file send started");

    let mut offset = 0usize;
    while offset < file.bytes.len() {
        if cancel.is_cancelled() {
            let _ = sink.send_frame(&Frame::FileAbort { id }).await;
            return Err(TransferError::Canceled);
        }
        if !sink.is_open() {
            return Err(TransferError::ChannelClosed);
        }

        let end = (offset + CHUNK_SIZE).min(file.bytes.len());
        let (ciphertext, iv) = crypto::encrypt_bytes(key, &file.bytes[offset..end])?;
        let mut wire = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wire.extend_from_slice(&iv);
        wire.extend_from_slice(&ciphertext);

        if let Err(e) = await_capacity(sink, wire.len(), cancel).await {
            if matches!(e, TransferError::Canceled) {
                let _ = sink.send_frame(&Frame::FileAbort { id }).await;
            }
            return Err(e);
        }
        sink.send_chunk(Bytes::from(wire)).await?;
        offset = end;

        let _ = events
            .send(SessionEvent::FileProgress {
                id,
                direction: TransferDirection::Outbound,
                transferred: offset as u64,
                total,
            })
            .await;
    }

    debug!(id = %id, "file send complete");
    Ok(())
}

/// Wait until the channel can absorb `next_len` more bytes without
/// crossing the high-water mark.
async fn await_capacity(
    sink: &dyn ChunkSink,
    next_len: usize,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }
        if !sink.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        if sink.buffered_amount().await + next_len <= BUFFER_HIGH_WATER {
            return Ok(());
        }
        tokio::select! {
            _ = sink.buffered_low() => {}
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(BACKPRESSURE_RECHECK) => {}
        }
    }
}

/// A fully assembled inbound file, ready for the application layer.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub id: Uuid,
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Assembly state for the single in-flight inbound file. New file
/// metadata while an assembly is incomplete discards the old one; a
/// chunk that fails to authenticate aborts the whole assembly.
#[derive(Debug)]
pub struct InboundAssembly {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    chunks: Vec<Vec<u8>>,
    received: u64,
}

impl InboundAssembly {
    pub fn new(id: Uuid, name: String, size: u64, mime_type: String) -> Self {
        Self {
            id,
            name,
            size,
            mime_type,
            chunks: Vec::new(),
            received: 0,
        }
    }

    /// Split off the nonce, authenticate and decrypt the remainder, and
    /// append the plaintext. Returns the updated bytes-received count.
    pub fn accept_chunk(&mut self, key: &SessionKey, frame: &[u8]) -> Result<u64, TransferError> {
        if frame.len() < NONCE_SIZE {
            return Err(TransferError::BadFrame);
        }
        let (iv, ciphertext) = frame.split_at(NONCE_SIZE);
        let plaintext = crypto::decrypt_bytes(key, ciphertext, iv)?;

        self.received += plaintext.len() as u64;
        if self.received > self.size {
            warn!(id = %self.id, received = self.received, declared = self.size,
                "inbound file overran its declared size");
            return Err(TransferError::Overrun);
        }
        self.chunks.push(plaintext);
        Ok(self.received)
    }

    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.size
    }

    pub fn into_received_file(self) -> ReceivedFile {
        let mut assembled = Vec::with_capacity(self.size as usize);
        for chunk in self.chunks {
            assembled.extend_from_slice(&chunk);
        }
        ReceivedFile {
            id: self.id,
            name: self.name,
            mime_type: self.mime_type,
            bytes: Bytes::from(assembled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use voile_shared::types::RoomId;

    struct FakeSink {
        frames: Mutex<Vec<Frame>>,
        chunks: Mutex<Vec<Bytes>>,
        buffered: AtomicUsize,
        open: AtomicBool,
        gate: Notify,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                chunks: Mutex::new(Vec::new()),
                buffered: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                gate: Notify::new(),
            }
        }

        fn sent_chunks(&self) -> Vec<Bytes> {
            self.chunks.lock().unwrap().clone()
        }

        fn sent_frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChunkSink for FakeSink {
        async fn send_frame(&self, frame: &Frame) -> Result<(), TransferError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        async fn send_chunk(&self, chunk: Bytes) -> Result<(), TransferError> {
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn buffered_low(&self) {
            self.gate.notified().await;
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn test_key() -> SessionKey {
        crypto::derive_session_key("hunter2", &RoomId::new("XFER-1")).unwrap()
    }

    fn outgoing(len: usize) -> OutgoingFile {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        OutgoingFile {
            name: "blob.bin".into(),
            mime_type: "application/octet-stream".into(),
            bytes: Bytes::from(bytes),
        }
    }

    async fn run_send(sink: &FakeSink, file: &OutgoingFile) -> Result<(), TransferError> {
        let (events, mut rx) = mpsc::channel(1024);
        let drain = tokio::spawn(async move {
            let mut last = 0u64;
            while let Some(event) = rx.recv().await {
                if let SessionEvent::FileProgress { transferred, .. } = event {
                    assert!(transferred >= last, "progress went backwards");
                    last = transferred;
                }
            }
            last
        });
        let result = send_file(
            sink,
            &test_key(),
            Uuid::new_v4(),
            file,
            &CancellationToken::new(),
            &events,
        )
        .await;
        drop(events);
        let final_progress = drain.await.unwrap();
        if result.is_ok() {
            assert_eq!(final_progress, file.bytes.len() as u64);
        }
        result
    }

    #[tokio::test]
    async fn test_exactly_one_chunk_at_chunk_size() {
        let sink = FakeSink::new();
        run_send(&sink, &outgoing(CHUNK_SIZE)).await.unwrap();
        assert_eq!(sink.sent_chunks().len(), 1);
    }

    #[tokio::test]
    async fn test_one_extra_byte_needs_two_chunks() {
        let sink = FakeSink::new();
        run_send(&sink, &outgoing(CHUNK_SIZE + 1)).await.unwrap();
        assert_eq!(sink.sent_chunks().len(), 2);
    }

    #[tokio::test]
    async fn test_max_size_accepted_and_one_byte_more_rejected() {
        assert!(ensure_sendable(MAX_FILE_SIZE).is_ok());
        assert!(matches!(
            ensure_sendable(MAX_FILE_SIZE + 1),
            Err(TransferError::TooLarge(_))
        ));

        // The oversized rejection happens before any frame is sent.
        let sink = FakeSink::new();
        let file = OutgoingFile {
            name: "huge.bin".into(),
            mime_type: "application/octet-stream".into(),
            bytes: Bytes::from(vec![0u8; (MAX_FILE_SIZE + 1) as usize]),
        };
        assert!(matches!(
            run_send(&sink, &file).await,
            Err(TransferError::TooLarge(_))
        ));
        assert!(sink.sent_frames().is_empty());
        assert!(sink.sent_chunks().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_emits_abort_before_next_chunk() {
        let sink = FakeSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (events, _rx) = mpsc::channel(16);
        let result = send_file(
            &sink,
            &test_key(),
            Uuid::new_v4(),
            &outgoing(CHUNK_SIZE * 3),
            &cancel,
            &events,
        )
        .await;
        assert!(matches!(result, Err(TransferError::Canceled)));
        assert!(sink.sent_chunks().is_empty());
        assert!(sink
            .sent_frames()
            .iter()
            .any(|f| matches!(f, Frame::FileAbort { .. })));
    }

    #[tokio::test]
    async fn test_channel_closure_is_treated_as_cancellation() {
        let sink = FakeSink::new();
        sink.open.store(false, Ordering::SeqCst);
        let (events, _rx) = mpsc::channel(16);
        let result = send_file(
            &sink,
            &test_key(),
            Uuid::new_v4(),
            &outgoing(CHUNK_SIZE),
            &CancellationToken::new(),
            &events,
        )
        .await;
        assert!(matches!(result, Err(TransferError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_sender_pauses_above_high_water_and_resumes_on_low() {
        let sink = std::sync::Arc::new(FakeSink::new());
        sink.buffered.store(BUFFER_HIGH_WATER + 1, Ordering::SeqCst);

        let sender = {
            let sink = sink.clone();
            tokio::spawn(async move {
                let (events, _rx) = mpsc::channel(1024);
                send_file(
                    sink.as_ref(),
                    &test_key(),
                    Uuid::new_v4(),
                    &outgoing(CHUNK_SIZE * 2),
                    &CancellationToken::new(),
                    &events,
                )
                .await
            })
        };

        // Pinned above the threshold: no chunk may be sent yet.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(sink.sent_chunks().is_empty());

        // Drain and fire the low-water callback.
        sink.buffered.store(0, Ordering::SeqCst);
        sink.gate.notify_waiters();

        sender.await.unwrap().unwrap();
        assert_eq!(sink.sent_chunks().len(), 2);
    }

    #[tokio::test]
    async fn test_sent_bytes_reassemble_identically() {
        let sink = FakeSink::new();
        let file = outgoing(CHUNK_SIZE * 2 + 777);
        run_send(&sink, &file).await.unwrap();

        let key = test_key();
        let mut assembly = InboundAssembly::new(
            Uuid::new_v4(),
            file.name.clone(),
            file.bytes.len() as u64,
            file.mime_type.clone(),
        );
        for chunk in sink.sent_chunks() {
            assembly.accept_chunk(&key, &chunk).unwrap();
        }
        assert!(assembly.is_complete());
        assert_eq!(assembly.into_received_file().bytes, file.bytes);
    }

    #[tokio::test]
    async fn test_wrong_key_chunk_aborts_assembly() {
        let sink = FakeSink::new();
        let file = outgoing(CHUNK_SIZE);
        run_send(&sink, &file).await.unwrap();

        let wrong = crypto::derive_session_key("not-hunter2", &RoomId::new("XFER-1")).unwrap();
        let mut assembly = InboundAssembly::new(
            Uuid::new_v4(),
            file.name.clone(),
            file.bytes.len() as u64,
            file.mime_type.clone(),
        );
        let err = assembly
            .accept_chunk(&wrong, &sink.sent_chunks()[0])
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Crypto(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_truncated_chunk_is_bad_frame() {
        let key = test_key();
        let mut assembly = InboundAssembly::new(Uuid::new_v4(), "x".into(), 10, "a/b".into());
        assert!(matches!(
            assembly.accept_chunk(&key, &[1, 2, 3]),
            Err(TransferError::BadFrame)
        ));
    }
}
