//! Frame reconstruction from the raw device byte stream.
//!
//! The device writes JSON objects back to back with no length prefix or
//! separator. A single socket read may hold several objects, or only part of
//! one, so the splitter keeps scanner state (nesting depth, string and escape
//! flags) between calls to [`FrameSplitter::push`].
//!
//! A close followed by an open brace (`}{`, whitespace allowed between them)
//! outside a string can never occur inside a JSON container, so it always
//! marks a frame boundary. An object that is missing its closing brace is
//! cut off there and dropped instead of swallowing the frames after it.

use thiserror::Error;
use tracing::warn;

use crate::link::proto::Message;

/// Reasons a delimited frame was dropped.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The delimited object is not a valid message.
    #[error("frame decode failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The object grew past the configured limit before it closed.
    #[error("frame exceeded {limit} bytes before closing")]
    Oversized { limit: usize },

    /// A new object started before the previous one closed.
    #[error("frame ended with {depth} unclosed nesting levels")]
    Unbalanced { depth: usize },
}

/// Incremental splitter turning byte chunks into decoded [`Message`] values.
#[derive(Debug)]
pub struct FrameSplitter {
    buf: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Last significant byte outside a string closed a container.
    after_close: bool,
    /// Skipping the rest of an oversized frame without buffering it.
    discarding: bool,
    max_frame_len: usize,
    dropped: u64,
}

impl FrameSplitter {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            after_close: false,
            discarding: false,
            max_frame_len: max_frame_len.max(2),
            dropped: 0,
        }
    }

    /// Consumes one chunk and returns every message it completed, in order.
    ///
    /// Undecodable frames are logged and skipped without affecting the rest
    /// of the chunk or later chunks.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut stray = 0usize;

        for &byte in chunk {
            if self.depth == 0 {
                match byte {
                    b'{' => self.open_frame(),
                    byte if byte.is_ascii_whitespace() => {}
                    _ => stray += 1,
                }
                continue;
            }

            if byte == b'{' && self.after_close && !self.in_string {
                self.abandon_frame();
                self.open_frame();
                continue;
            }

            if !self.discarding {
                self.buf.push(byte);
                if self.buf.len() > self.max_frame_len {
                    let len = self.buf.len();
                    self.buf.clear();
                    self.discarding = true;
                    self.record_drop(
                        FrameError::Oversized {
                            limit: self.max_frame_len,
                        },
                        len,
                    );
                }
            }
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => {
                    self.in_string = true;
                    self.after_close = false;
                }
                b'{' | b'[' => {
                    self.depth += 1;
                    self.after_close = false;
                }
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.close_frame(&mut messages);
                        continue;
                    }
                    self.after_close = true;
                }
                byte if byte.is_ascii_whitespace() => {}
                _ => self.after_close = false,
            }
        }

        if stray > 0 {
            warn!(event = "frame_stray_bytes", bytes = stray);
        }

        messages
    }

    /// Number of frames dropped because they failed to decode.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Bytes held for an object that has not closed yet.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn record_drop(&mut self, error: FrameError, len: usize) {
        self.dropped += 1;
        warn!(event = "frame_parse_failed", frame_len = len, error = %error);
    }

    fn open_frame(&mut self) {
        self.buf.push(b'{');
        self.depth = 1;
    }

    fn close_frame(&mut self, messages: &mut Vec<Message>) {
        let frame = std::mem::take(&mut self.buf);
        let discarded = self.discarding;
        self.reset();
        if discarded {
            return;
        }
        match Message::from_slice(&frame) {
            Ok(message) => messages.push(message),
            Err(err) => self.record_drop(FrameError::Json(err), frame.len()),
        }
    }

    /// Drops an object that never closed. Oversized frames were already
    /// counted when they crossed the limit.
    fn abandon_frame(&mut self) {
        let len = self.buf.len();
        let depth = self.depth;
        let discarded = self.discarding;
        self.reset();
        if !discarded {
            self.record_drop(FrameError::Unbalanced { depth }, len);
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.after_close = false;
        self.discarding = false;
    }
}
