use crate::error::LinkError;
use crate::types::RoomId;

/// Magic-link payload carried in the fragment of an entry URL:
/// `room=<id>&pass=<passphrase>`.
///
/// This is the only surface that transports a passphrase in-band;
/// callers must treat the link itself as an out-of-band share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicLink {
    pub room: RoomId,
    pub passphrase: String,
}

impl MagicLink {
    pub fn new(room: RoomId, passphrase: String) -> Self {
        Self { room, passphrase }
    }

    /// Parse a URL fragment. Accepts a full URL, a `#`-prefixed
    /// fragment, or the bare `room=…&pass=…` pair.
    pub fn parse(input: &str) -> Result<Self, LinkError> {
        let fragment = match input.rfind('#') {
            Some(pos) => &input[pos + 1..],
            None => input,
        };

        let mut room = None;
        let mut passphrase = None;
        for pair in fragment.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or(LinkError::InvalidFormat)?;
            match key {
                "room" => room = Some(percent_decode(value)?),
                "pass" => passphrase = Some(percent_decode(value)?),
                _ => {}
            }
        }

        let room = room.filter(|r| !r.is_empty()).ok_or(LinkError::MissingRoom)?;
        let passphrase = passphrase
            .filter(|p| !p.is_empty())
            .ok_or(LinkError::MissingPassphrase)?;

        Ok(Self {
            room: RoomId::new(&room),
            passphrase,
        })
    }

    /// Render the fragment (without the leading `#`).
    pub fn to_fragment(&self) -> String {
        format!(
            "room={}&pass={}",
            percent_encode(self.room.as_str()),
            percent_encode(&self.passphrase)
        )
    }
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(raw: &str) -> Result<String, LinkError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_digit(*bytes.get(i + 1).ok_or(LinkError::InvalidFormat)?)?;
                let lo = hex_digit(*bytes.get(i + 2).ok_or(LinkError::InvalidFormat)?)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| LinkError::InvalidFormat)
}

fn hex_digit(c: u8) -> Result<u8, LinkError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(LinkError::InvalidFormat),
    }
}
