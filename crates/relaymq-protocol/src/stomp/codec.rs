//! STOMP frame codec for `tokio_util::codec::Framed`.
//!
//! Wire layout of a frame:
//!
//! ```text
//! COMMAND\n
//! key:value\n        (zero or more, escaped from 1.1 on)
//! \n
//! body\0
//! ```
//!
//! A bare EOL between frames is a heartbeat. When a frame carries
//! `content-length`, exactly that many body bytes are taken before looking
//! for the terminating NUL; otherwise the body runs to the first NUL.

use std::borrow::Cow;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::frame::{StompFrame, command};
use crate::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Items carried on a STOMP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A bare EOL.
    Heartbeat,
    /// A complete frame.
    Frame(StompFrame),
}

impl From<StompFrame> for StompItem {
    fn from(frame: StompFrame) -> Self {
        Self::Frame(frame)
    }
}

/// Escapes a header key or value for the wire.
pub fn escape_header(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', ':', '\n']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\c"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Reverses [`escape_header`].
///
/// Colon is accepted both as `\c` and as the legacy `\:`. Any other escape
/// sequence is a framing violation.
pub fn unescape_header(value: &str) -> ProtocolResult<Cow<'_, str>> {
    if !value.contains('\\') {
        return Ok(Cow::Borrowed(value));
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('c') | Some(':') => out.push(':'),
            Some('n') => out.push('\n'),
            Some(other) => {
                return Err(ProtocolError::malformed(format!(
                    "undefined escape sequence \\{other}"
                )));
            }
            None => return Err(ProtocolError::malformed("dangling escape in header")),
        }
    }
    Ok(Cow::Owned(out))
}

/// STOMP codec.
///
/// Header escaping starts disabled (CONNECT is never escaped) and is switched
/// on by the session once a version of 1.1 or later has been negotiated.
#[derive(Debug, Clone)]
pub struct StompCodec {
    escape_headers: bool,
    max_frame_size: usize,
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl StompCodec {
    /// Creates a codec that rejects frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            escape_headers: false,
            max_frame_size,
        }
    }

    /// Enables or disables header escaping.
    pub fn set_escape_headers(&mut self, enabled: bool) {
        self.escape_headers = enabled;
    }

    /// Returns true if header escaping is enabled.
    pub fn escape_headers(&self) -> bool {
        self.escape_headers
    }

    fn escapes(&self, command: &str) -> bool {
        self.escape_headers
            && !matches!(
                command,
                command::CONNECT | command::STOMP | command::CONNECTED
            )
    }

    fn check_size(&self, len: usize) -> ProtocolResult<()> {
        if len > self.max_frame_size {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    fn parse_head(&self, head: &str) -> ProtocolResult<StompFrame> {
        let mut lines = head
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line));

        let command = lines.next().unwrap_or_default().trim();
        if command.is_empty() {
            return Err(ProtocolError::malformed("missing command"));
        }
        let escapes = self.escapes(command);
        let mut frame = StompFrame::new(command);

        for line in lines.filter(|line| !line.is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                return Err(ProtocolError::malformed(format!(
                    "header line without colon: {line:?}"
                )));
            };
            if escapes {
                frame.push_header(unescape_header(key)?, unescape_header(value)?);
            } else {
                frame.push_header(key, value);
            }
        }
        Ok(frame)
    }
}

/// Returns the offset just past the blank line ending the frame head.
fn find_head_end(src: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    while let Some(offset) = src[line_start..].iter().position(|b| *b == b'\n') {
        let line_end = line_start + offset;
        let line = &src[line_start..line_end];
        if line_start > 0 && (line.is_empty() || line == b"\r") {
            return Some(line_end + 1);
        }
        line_start = line_end + 1;
    }
    None
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<StompItem>> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(b'\r') => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if src[1] != b'\n' {
                    return Err(ProtocolError::malformed("stray carriage return"));
                }
                src.advance(2);
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(_) => {}
        }

        let Some(body_start) = find_head_end(src) else {
            self.check_size(src.len())?;
            return Ok(None);
        };

        let head = std::str::from_utf8(&src[..body_start])
            .map_err(|_| ProtocolError::malformed("frame head is not valid UTF-8"))?;
        let frame = self.parse_head(head)?;

        let (body_end, frame_end) = match frame.content_length()? {
            Some(len) => {
                self.check_size(len)?;
                let body_end = body_start
                    .checked_add(len)
                    .ok_or_else(|| ProtocolError::malformed("content-length out of range"))?;
                self.check_size(body_end.saturating_add(1))?;
                if src.len() <= body_end {
                    src.reserve(body_end - src.len() + 1);
                    return Ok(None);
                }
                let Some(nul) = src[body_end..].iter().position(|b| *b == 0) else {
                    self.check_size(src.len())?;
                    return Ok(None);
                };
                if nul > 0 {
                    trace!(
                        discarded = nul,
                        "Discarding bytes between declared body and frame terminator"
                    );
                }
                (body_end, body_end + nul + 1)
            }
            None => {
                let Some(nul) = src[body_start..].iter().position(|b| *b == 0) else {
                    self.check_size(src.len())?;
                    return Ok(None);
                };
                (body_start + nul, body_start + nul + 1)
            }
        };

        let mut raw = src.split_to(frame_end);
        raw.truncate(body_end);
        let body = raw.split_off(body_start).freeze();
        Ok(Some(StompItem::Frame(frame.body(body))))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> ProtocolResult<()> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        let escapes = self.escapes(frame.command());
        dst.reserve(frame.command().len() + frame.payload().len() + 64);
        dst.extend_from_slice(frame.command().as_bytes());
        dst.put_u8(b'\n');
        for (key, value) in frame.headers() {
            if escapes {
                dst.extend_from_slice(escape_header(key).as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(escape_header(value).as_bytes());
            } else {
                dst.extend_from_slice(key.as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.extend_from_slice(frame.payload());
        dst.put_u8(0);
        Ok(())
    }
}
