//! Contract consumed from the external capture/filter pipeline.
//!
//! The core never touches raw camera frames: it requests a processed
//! output stream whose visual frames already reflect the selected
//! privacy mode. The core owns only the audio track's enabled flag
//! (mute) and the video track's enabled flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use voile_shared::types::PrivacyMode;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,

    #[error("no capture device available")]
    Unavailable,

    #[error("capture device is busy")]
    Busy,

    #[error("media pipeline timed out")]
    Timeout,
}

impl MediaError {
    /// Busy hardware and pipeline timeouts are worth one audio-only
    /// retry; denial and absence are not.
    pub fn is_retryable(self) -> bool {
        matches!(self, MediaError::Busy | MediaError::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one local media track. The enabled flag is shared with the
/// pipeline, which gates actual frame production on it.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: Uuid,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl MediaStream {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn stop(&self) {
        if let Some(track) = &self.audio {
            track.stop();
        }
        if let Some(track) = &self.video {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaPipeline: Send + Sync + 'static {
    /// Request a processed output stream. The returned stream's video
    /// frames MUST already reflect `mode`. When video hardware is
    /// unavailable the pipeline may return an audio-only stream even
    /// with `want_video` set; the core then disables video locally.
    async fn acquire(
        &self,
        mode: PrivacyMode,
        want_video: bool,
    ) -> Result<MediaStream, MediaError>;

    /// Point the pipeline at a new privacy mode for subsequent frames.
    async fn apply_privacy(&self, mode: PrivacyMode) -> Result<(), MediaError>;
}

/// Acquire the local stream, falling back exactly once to audio-only
/// when the hardware is busy or the pipeline times out.
pub async fn acquire_with_fallback(
    pipeline: &dyn MediaPipeline,
    mode: PrivacyMode,
) -> Result<MediaStream, MediaError> {
    match pipeline.acquire(mode, true).await {
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, "video capture failed, retrying audio-only");
            pipeline.acquire(mode, false).await
        }
        other => other,
    }
}

/// Pipeline that synthesizes silent/black tracks. Stands in for a real
/// capture pipeline in the demo binary and the test suites.
#[derive(Debug, Clone)]
pub struct SyntheticPipeline {
    pub video_available: bool,
}

impl SyntheticPipeline {
    pub fn new() -> Self {
        Self {
            video_available: true,
        }
    }
}

impl Default for SyntheticPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaPipeline for SyntheticPipeline {
    async fn acquire(
        &self,
        _mode: PrivacyMode,
        want_video: bool,
    ) -> Result<MediaStream, MediaError> {
        Ok(MediaStream {
            audio: Some(MediaTrack::new(TrackKind::Audio)),
            video: (want_video && self.video_available).then(|| MediaTrack::new(TrackKind::Video)),
        })
    }

    async fn apply_privacy(&self, _mode: PrivacyMode) -> Result<(), MediaError> {
        Ok(())
    }
}
