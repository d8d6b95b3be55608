//! Newline-delimited framing for QMP messages.
//!
//! QMP puts exactly one JSON object on each line. Line splitting is delegated
//! to [`LinesCodec`]; this codec only turns lines into [`Message`]s and back.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec};

use crate::{
    error::{Error, Result},
    message::Message,
};

/// Default maximum line length (16 MiB).
///
/// `query-qmp-schema` replies run to several hundred KiB.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Codec for newline-delimited QMP messages.
#[derive(Debug)]
pub struct QmpCodec {
    lines: LinesCodec,
}

impl QmpCodec {
    /// Create a codec with [`DEFAULT_MAX_LINE_LENGTH`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a codec that rejects lines longer than `max_length` bytes.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }
}

impl Default for QmpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for QmpCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        // Blank lines carry nothing; keep going so a complete line behind
        // one is not left waiting for more input.
        while let Some(line) = self.lines.decode(src)? {
            if !line.trim().is_empty() {
                return Message::parse(&line).map(Some);
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        // A final line without a terminator still counts.
        while let Some(line) = self.lines.decode_eof(src)? {
            if !line.trim().is_empty() {
                return Message::parse(&line).map(Some);
            }
        }
        Ok(None)
    }
}

impl Encoder<Message> for QmpCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = item.to_line()?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}
