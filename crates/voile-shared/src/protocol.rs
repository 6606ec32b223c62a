use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::PrivacyMode;

/// JSON text frames exchanged over the data channel. Binary frames are
/// not part of this enum: they are opaque `nonce[12] ‖ ciphertext` chunks
/// belonging to an in-progress file transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Authenticated-encrypted UTF-8 chat message.
    Chat { data: String, iv: String },

    /// The peer's current privacy mode; drives the remote participant's
    /// display flags. Never inferred from the transport.
    #[serde(rename_all = "camelCase")]
    PrivacyUpdate {
        filter: PrivacyMode,
        audio_enabled: bool,
        video_enabled: bool,
    },

    /// Declaration that a file transfer is beginning.
    #[serde(rename_all = "camelCase")]
    FileMeta {
        id: Uuid,
        name: String,
        size: u64,
        mime_type: String,
    },

    /// Sender canceled a transfer mid-stream.
    FileAbort { id: Uuid },

    /// Peer requested orderly teardown.
    SessionTerminate {},

    /// Display name announcement, sent once when the channel opens.
    PeerInfo { name: String },

    /// Forward compatibility: unknown `type` values decode here and are
    /// logged and dropped by the receiver.
    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_frame_roundtrip() {
        let frame = Frame::Chat {
            data: "b64data".into(),
            iv: "b64iv".into(),
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"chat\""));
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn test_privacy_update_uses_camel_case_payload() {
        let frame = Frame::PrivacyUpdate {
            filter: PrivacyMode::Blur,
            audio_enabled: true,
            video_enabled: false,
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"privacy-update\""));
        assert!(json.contains("\"audioEnabled\":true"));
        assert!(json.contains("\"videoEnabled\":false"));
        assert!(json.contains("\"filter\":\"blur\""));
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn test_file_meta_roundtrip() {
        let frame = Frame::FileMeta {
            id: Uuid::new_v4(),
            name: "photo.png".into(),
            size: 123_456,
            mime_type: "image/png".into(),
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"file-meta\""));
        assert!(json.contains("\"mimeType\":\"image/png\""));
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn test_terminate_has_empty_payload() {
        let json = Frame::SessionTerminate {}.to_json().unwrap();
        assert_eq!(json, "{\"type\":\"session-terminate\"}");
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let decoded =
            Frame::from_json("{\"type\":\"typing-indicator\",\"active\":true}").unwrap();
        assert_eq!(decoded, Frame::Unknown);
    }
}
