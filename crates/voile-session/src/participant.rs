use crate::media::MediaStream;

/// One side of the call as shown to the embedder. The remote
/// participant's audio/video flags are driven solely by inbound
/// `privacy-update` frames, never inferred from the transport.
#[derive(Debug, Clone)]
pub struct Participant {
    pub display_name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub stream: Option<MediaStream>,
}

impl Participant {
    pub fn local(display_name: String, stream: MediaStream) -> Self {
        let video_enabled = stream.has_video();
        Self {
            display_name,
            audio_enabled: true,
            video_enabled,
            stream: Some(stream),
        }
    }

    /// Placeholder created when the transport connects, before the
    /// peer's `peer-info` and `privacy-update` frames arrive. The
    /// stream attaches as remote tracks are announced.
    pub fn remote_placeholder() -> Self {
        Self {
            display_name: String::new(),
            audio_enabled: true,
            video_enabled: true,
            stream: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantView {
    pub local: Participant,
    pub remote: Option<Participant>,
}
