//! Newline-delimited token codec.
//!
//! Each frame is one ASCII token followed by `\n`. Segments are trimmed and
//! looked up in the token table; anything that is not a known command
//! (reserved tokens, unknown tokens, non-UTF-8 bytes) is dropped so decoding
//! always makes progress.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::error::SyncError;
use crate::message::{Command, Message};

/// Longest unterminated line kept in the receive buffer.
pub const MAX_LINE_LENGTH: usize = 1024;

const DELIMITER: u8 = b'\n';

/// Encode a command as its token plus one trailing newline.
pub fn encode(command: Command) -> Vec<u8> {
    let token = command.message().token();
    let mut out = Vec::with_capacity(token.len() + 1);
    out.extend_from_slice(token.as_bytes());
    out.push(DELIMITER);
    out
}

/// Decode every complete line in `buffer`, leaving only the bytes of an
/// unterminated line behind.
pub fn decode(buffer: &mut BytesMut) -> Vec<Command> {
    let mut codec = LineCodec::new();
    let mut commands = Vec::new();
    // LineCodec::decode never fails.
    while let Ok(Some(command)) = codec.decode(buffer) {
        commands.push(command);
    }
    commands
}

/// `tokio_util` codec for the line protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl LineCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for LineCodec {
    type Item = Command;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == DELIMITER) else {
                if src.len() > MAX_LINE_LENGTH {
                    warn!("discarding {} bytes of unterminated input", src.len());
                    src.clear();
                }
                return Ok(None);
            };

            let line = src.split_to(pos);
            src.advance(1);

            let Ok(text) = std::str::from_utf8(&line) else {
                trace!("discarding non-utf8 line");
                continue;
            };
            match Message::from_token(text.trim()).and_then(|m| m.command()) {
                Some(command) => return Ok(Some(command)),
                None => trace!("ignoring token {:?}", text.trim()),
            }
        }
    }
}

impl Encoder<Command> for LineCodec {
    type Error = SyncError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let token = item.message().token();
        dst.reserve(token.len() + 1);
        dst.put_slice(token.as_bytes());
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
