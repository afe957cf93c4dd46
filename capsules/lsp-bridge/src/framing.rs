//! `Content-Length` framing used on the language-server side of the bridge.

use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on the header section, terminator excluded.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame header exceeds {limit} bytes without a terminator")]
    HeaderTooLarge { limit: usize },

    #[error("Malformed frame header: {reason}")]
    MalformedHeader { reason: String },

    #[error("Frame header has no Content-Length")]
    MissingContentLength,

    #[error("Declared frame length {declared} exceeds the {limit} byte limit")]
    FrameTooLarge { declared: String, limit: usize },
}

impl FramingError {
    pub fn code(&self) -> &'static str {
        match self {
            FramingError::HeaderTooLarge { .. } => "FRAME_HEADER_TOO_LARGE",
            FramingError::MalformedHeader { .. } => "FRAME_HEADER_MALFORMED",
            FramingError::MissingContentLength => "FRAME_MISSING_CONTENT_LENGTH",
            FramingError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
        }
    }
}

/// Wrap one payload for the language-server side.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body { len: usize },
}

/// Incremental decoder for a `Content-Length` framed byte stream.
///
/// Bytes are pushed as they arrive, in chunks of any size; complete payloads
/// are pulled out with [`FrameDecoder::next_frame`]. Leftover bytes of the
/// next frame stay buffered across pushes. Any error is terminal: the stream
/// cannot be resynchronized.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: DecodeState,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            state: DecodeState::Header,
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete payload, or `None` until more bytes are pushed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(end) = find(&self.buffer, HEADER_TERMINATOR) else {
                        if self.buffer.len() >= MAX_HEADER_BYTES + HEADER_TERMINATOR.len() {
                            return Err(FramingError::HeaderTooLarge {
                                limit: MAX_HEADER_BYTES,
                            });
                        }
                        return Ok(None);
                    };
                    if end > MAX_HEADER_BYTES {
                        return Err(FramingError::HeaderTooLarge {
                            limit: MAX_HEADER_BYTES,
                        });
                    }

                    let len = parse_header(&self.buffer[..end], self.max_frame_bytes)?;
                    self.buffer.drain(..end + HEADER_TERMINATOR.len());
                    self.state = DecodeState::Body { len };
                }
                DecodeState::Body { len } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let rest = self.buffer.split_off(len);
                    let payload = std::mem::replace(&mut self.buffer, rest);
                    self.state = DecodeState::Header;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_header(section: &[u8], max_frame_bytes: usize) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(section).map_err(|_| FramingError::MalformedHeader {
        reason: "header is not valid UTF-8".to_string(),
    })?;

    let mut length = None;
    for line in text.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FramingError::MalformedHeader {
                reason: format!("header line '{}' has no ':'", line.escape_debug()),
            })?;
        if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }
        if length.is_some() {
            return Err(FramingError::MalformedHeader {
                reason: "duplicate Content-Length".to_string(),
            });
        }
        length = Some(parse_length(value.trim(), max_frame_bytes)?);
    }

    length.ok_or(FramingError::MissingContentLength)
}

fn parse_length(value: &str, max_frame_bytes: usize) -> Result<usize, FramingError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FramingError::MalformedHeader {
            reason: format!("invalid Content-Length '{}'", value.escape_debug()),
        });
    }

    let too_large = || FramingError::FrameTooLarge {
        declared: value.to_string(),
        limit: max_frame_bytes,
    };
    // All digits, so a parse failure can only be overflow.
    let declared: usize = value.parse().map_err(|_| too_large())?;
    if declared > max_frame_bytes {
        return Err(too_large());
    }
    Ok(declared)
}
