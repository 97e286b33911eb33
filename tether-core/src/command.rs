//! The command value type carried by every frame.
//!
//! A `Command` is `{ id, version, payload }`; the codec wraps it in a
//! length-prefixed envelope (see [`crate::codec`]). Construction
//! validates the payload size so encoding a built `Command` never fails.

use bytes::Bytes;

use crate::error::TetherError;

/// Protocol version stamped into envelopes unless overridden.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes of envelope content occupied by the id and version fields.
pub const CONTENT_HEADER_LEN: usize = 2;

/// Hard cap on the envelope content length a codec will accept.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload a single command may carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - CONTENT_HEADER_LEN;

/// One application command as it travels the wire.
///
/// The payload is opaque to the framework; applications assign meaning
/// to `id` values. The text hint only selects the WebSocket frame kind
/// for outbound sends and is not part of the envelope itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: u8,
    version: u8,
    payload: Bytes,
    text: bool,
}

impl Command {
    /// Builds a binary command with the default protocol version.
    pub fn new(id: u8, payload: impl Into<Bytes>) -> Result<Self, TetherError> {
        Self::with_version(id, PROTOCOL_VERSION, payload)
    }

    /// Builds a binary command with an explicit protocol version.
    pub fn with_version(
        id: u8,
        version: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, TetherError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TetherError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            id,
            version,
            payload,
            text: false,
        })
    }

    /// Builds a command from a string payload, flagged for text-frame
    /// delivery in WebSocket mode.
    pub fn text(id: u8, payload: impl Into<String>) -> Result<Self, TetherError> {
        let mut cmd = Self::new(id, Bytes::from(payload.into().into_bytes()))?;
        cmd.text = true;
        Ok(cmd)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_text(&self) -> bool {
        self.text
    }

    /// Value of the envelope's length field: header plus payload bytes.
    pub fn content_len(&self) -> usize {
        CONTENT_HEADER_LEN + self.payload.len()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_version() {
        let cmd = Command::new(4, Bytes::from_static(b"screen")).unwrap();
        assert_eq!(cmd.id(), 4);
        assert_eq!(cmd.version(), PROTOCOL_VERSION);
        assert_eq!(cmd.payload().as_ref(), b"screen");
        assert!(!cmd.is_text());
    }

    #[test]
    fn content_len_counts_header() {
        let cmd = Command::new(1, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(cmd.content_len(), 5);

        let empty = Command::new(1, Bytes::new()).unwrap();
        assert_eq!(empty.content_len(), CONTENT_HEADER_LEN);
    }

    #[test]
    fn rejects_oversized_payload() {
        let huge = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = Command::new(1, huge).unwrap_err();
        assert!(matches!(err, TetherError::PayloadTooLarge { .. }));
    }

    #[test]
    fn text_command_keeps_bytes() {
        let cmd = Command::text(3, "{\"x\":1}").unwrap();
        assert!(cmd.is_text());
        assert_eq!(cmd.payload().as_ref(), b"{\"x\":1}");
    }
}
