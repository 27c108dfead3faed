//! Streaming inference support
//!
//! Token-by-token delivery of generated text to the transport.

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation completed successfully
    Done,
    /// Generation ended with an error
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done)
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Returns true for `Done` and `Error`, after which nothing else is sent
    pub fn is_terminal(&self) -> bool {
        !self.is_token()
    }

    /// Extracts the fragment if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamToken::Error(s) => Some(s),
            _ => None,
        }
    }
}

/// The receiving side of a stream went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream receiver dropped")]
pub struct SinkClosed;

/// Where the engine pushes generated fragments.
///
/// A request produces zero or more fragments followed by exactly one
/// `emit_error` or `emit_done`.
pub trait TokenSink {
    fn emit_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed>;
    fn emit_error(&mut self, message: &str);
    fn emit_done(&mut self);
}

impl TokenSink for UnboundedSender<StreamToken> {
    fn emit_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed> {
        self.send(StreamToken::Token(fragment.to_string()))
            .map_err(|_| SinkClosed)
    }

    fn emit_error(&mut self, message: &str) {
        let _ = self.send(StreamToken::Error(message.to_string()));
    }

    fn emit_done(&mut self) {
        let _ = self.send(StreamToken::Done);
    }
}

/// Collects everything in memory
impl TokenSink for Vec<StreamToken> {
    fn emit_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed> {
        self.push(StreamToken::Token(fragment.to_string()));
        Ok(())
    }

    fn emit_error(&mut self, message: &str) {
        self.push(StreamToken::Error(message.to_string()));
    }

    fn emit_done(&mut self) {
        self.push(StreamToken::Done);
    }
}

/// Joins token bytes into complete UTF-8 fragments.
///
/// A multi-byte character can be split over several tokens; the incomplete
/// suffix is held back until the rest arrives.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add token bytes and return whatever complete text is now available.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let ready = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Incomplete sequence at the end: emit the valid prefix, keep the tail.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid bytes will never become valid; replace them now.
            Err(_) => self.pending.len(),
        };
        if ready == 0 {
            return None;
        }

        let fragment = String::from_utf8_lossy(&self.pending[..ready]).into_owned();
        self.pending.drain(..ready);
        Some(fragment)
    }

    /// Flush any held bytes, replacing an unfinished sequence.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let fragment = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(fragment)
    }
}
