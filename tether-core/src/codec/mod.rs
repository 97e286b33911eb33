//! Wire framing for command envelopes.
//!
//! Raw mode puts each command on the stream as
//!
//! ```text
//! +------------------+---------+----------+-------------------+
//! | length (LE32)    | id (1B) | ver (1B) | payload (N bytes) |
//! +------------------+---------+----------+-------------------+
//! length = 1 + 1 + N   (excludes the length field itself)
//! ```
//!
//! [`CommandCodec`] implements tokio-util's `Decoder`/`Encoder`, so a
//! frame split across reads is buffered until complete (stream
//! re-assembly, not one-shot parsing). WebSocket mode carries the same
//! envelope as the content of a single frame; [`encode_content`] and
//! [`decode_content`] handle that already-delimited case.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{CONTENT_HEADER_LEN, Command, MAX_FRAME_SIZE};
use crate::error::TetherError;

/// Bytes occupied by the length prefix.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Codec for the raw-TCP framing mode.
///
/// Stateless; the reassembly buffer lives in the `Framed` transport.
#[derive(Debug, Default)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, TetherError> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let declared = (&src[..LENGTH_FIELD_LEN]).get_u32_le() as usize;
        if declared < CONTENT_HEADER_LEN {
            return Err(TetherError::InvalidFrameLength { declared });
        }
        if declared > MAX_FRAME_SIZE {
            return Err(TetherError::FrameTooLarge {
                size: declared,
                max: MAX_FRAME_SIZE,
            });
        }

        let frame_len = LENGTH_FIELD_LEN + declared;
        if src.len() < frame_len {
            // Reserve what the rest of the frame needs and wait.
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(LENGTH_FIELD_LEN);
        let id = frame.get_u8();
        let version = frame.get_u8();
        let cmd = Command::with_version(id, version, frame.freeze())?;
        Ok(Some(cmd))
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = TetherError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), TetherError> {
        let content_len = item.content_len();
        dst.reserve(LENGTH_FIELD_LEN + content_len);
        dst.put_u32_le(content_len as u32);
        dst.put_u8(item.id());
        dst.put_u8(item.version());
        dst.extend_from_slice(item.payload());
        Ok(())
    }
}

// ── WebSocket content helpers ────────────────────────────────────

/// Encodes a command into the content of one WebSocket frame.
pub fn encode_content(cmd: &Command) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + cmd.content_len());
    buf.put_u32_le(cmd.content_len() as u32);
    buf.put_u8(cmd.id());
    buf.put_u8(cmd.version());
    buf.extend_from_slice(cmd.payload());
    buf.freeze()
}

/// Decodes the content of one WebSocket frame.
///
/// The frame boundary already came from the WebSocket layer, so the
/// embedded length field must match the content exactly.
pub fn decode_content(mut content: Bytes) -> Result<Command, TetherError> {
    if content.len() < LENGTH_FIELD_LEN + CONTENT_HEADER_LEN {
        return Err(TetherError::TruncatedContent {
            len: content.len(),
        });
    }

    let declared = content.get_u32_le() as usize;
    if declared > MAX_FRAME_SIZE {
        return Err(TetherError::FrameTooLarge {
            size: declared,
            max: MAX_FRAME_SIZE,
        });
    }
    if declared != content.remaining() {
        return Err(TetherError::ContentLengthMismatch {
            declared,
            actual: content.remaining(),
        });
    }

    let id = content.get_u8();
    let version = content.get_u8();
    Command::with_version(id, version, content)
}

// ── Tests ────────────────────────────────────────────────────────
