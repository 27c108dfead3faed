//! Conversation state
//!
//! Keeps the chat history of the single server session and remembers how much of
//! the rendered template has already been pushed into the model, so each request
//! only tokenizes the new part.

use crate::inference::backend::TokenCodec;
use crate::inference::error::{ErrorKind, GenerationError};
use crate::types::{Role, Turn};

/// Rendered template text not yet submitted to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptDelta {
    pub text: String,
    /// Length of the full rendered template this delta was cut from
    pub rendered_len: usize,
}

/// Append-only chat history plus the submitted-template boundary
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    submitted_boundary: usize,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_turn(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(Turn::new(role, content));
    }

    /// Drop every turn after the first `len`. The boundary is untouched, so
    /// this may only remove turns that were never submitted.
    pub fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Bytes of rendered template already attributed to the model context
    pub fn submitted_boundary(&self) -> usize {
        self.submitted_boundary
    }

    /// Render all turns with the generation prompt and cut off what was already submitted.
    ///
    /// Templates must only grow across the conversation. A render that ends before
    /// the boundary, or splits a character at it, is reported as a template failure.
    pub fn render_delta<C: TokenCodec + ?Sized>(
        &self,
        codec: &C,
    ) -> Result<PromptDelta, GenerationError> {
        let rendered = codec
            .apply_chat_template(&self.turns, true)
            .map_err(|e| GenerationError::new(ErrorKind::TemplateFailure, e))?;

        let text = rendered.get(self.submitted_boundary..).ok_or_else(|| {
            GenerationError::new(
                ErrorKind::TemplateFailure,
                format!(
                    "rendered template of {} bytes does not continue the submitted {} bytes",
                    rendered.len(),
                    self.submitted_boundary
                ),
            )
        })?;

        Ok(PromptDelta {
            text: text.to_string(),
            rendered_len: rendered.len(),
        })
    }

    /// Length of the template rendered without the generation prompt.
    pub fn closed_len<C: TokenCodec + ?Sized>(&self, codec: &C) -> Result<usize, GenerationError> {
        codec
            .apply_chat_template(&self.turns, false)
            .map(|rendered| rendered.len())
            .map_err(|e| GenerationError::new(ErrorKind::TemplateFailure, e))
    }

    pub fn advance_boundary(&mut self, new_len: usize) {
        debug_assert!(new_len >= self.submitted_boundary);
        self.submitted_boundary = new_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::MockCodec;

    #[test]
    fn test_first_delta_is_whole_template() {
        let codec = MockCodec::new();
        let mut conv = Conversation::new();
        conv.append_turn(Role::User, "Hello");

        let delta = conv.render_delta(&codec).unwrap();
        assert_eq!(delta.text, "<|user|>Hello\n<|assistant|>");
        assert_eq!(delta.rendered_len, delta.text.len());
        assert_eq!(conv.submitted_boundary(), 0);
    }

    #[test]
    fn test_delta_starts_at_boundary() {
        let codec = MockCodec::new();
        let mut conv = Conversation::new();
        conv.append_turn(Role::User, "Hello");
        conv.append_turn(Role::Assistant, "Hi there");
        let closed = conv.closed_len(&codec).unwrap();
        conv.advance_boundary(closed);

        conv.append_turn(Role::User, "How are you?");
        let delta = conv.render_delta(&codec).unwrap();
        assert_eq!(delta.text, "<|user|>How are you?\n<|assistant|>");
        assert!(!delta.text.contains("Hello"));
        assert_eq!(delta.rendered_len, closed + delta.text.len());
    }

    #[test]
    fn test_template_failure_leaves_boundary() {
        let codec = MockCodec::failing_template();
        let mut conv = Conversation::new();
        conv.append_turn(Role::User, "Hello");

        let err = conv.render_delta(&codec).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateFailure);
        assert_eq!(conv.submitted_boundary(), 0);
        assert_eq!(conv.turns().len(), 1);
    }

    #[test]
    fn test_truncate_restores_previous_delta() {
        let codec = MockCodec::new();
        let mut conv = Conversation::new();
        conv.append_turn(Role::User, "Hello");
        conv.append_turn(Role::Assistant, "Hi there");
        conv.advance_boundary(conv.closed_len(&codec).unwrap());

        conv.append_turn(Role::User, "a very long question that did not fit");
        conv.truncate(2);
        conv.append_turn(Role::User, "Short?");

        let delta = conv.render_delta(&codec).unwrap();
        assert_eq!(delta.text, "<|user|>Short?\n<|assistant|>");
        assert_eq!(conv.turns().len(), 3);
    }

    #[test]
    fn test_shrinking_template_is_rejected() {
        let codec = MockCodec::new();
        let mut conv = Conversation::new();
        conv.append_turn(Role::User, "Hi");
        conv.advance_boundary(1000);

        let err = conv.render_delta(&codec).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateFailure);
    }
}
