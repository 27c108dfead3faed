//! Generation engine
//!
//! Drives one request through the single model session:
//!
//! 1. append the user turn and render the not-yet-submitted part of the template
//! 2. tokenize it (BOS only on the very first submission) and decode it
//! 3. sample, stop on end-of-generation, detokenize, emit, accept, decode the token
//!
//! Every terminal condition updates the slot and the metrics. Only a successful
//! request is written back into the conversation.

use std::time::Instant;

use serde::Serialize;

use crate::inference::backend::{ModelSession, SamplingPolicy, TokenCodec, TokenId};
use crate::inference::conversation::Conversation;
use crate::inference::error::{ErrorKind, GenerationError};
use crate::inference::slot::{Slot, SlotState};
use crate::inference::streaming::{TokenSink, Utf8Assembler};
use crate::system::metrics::{self, SharedMetrics};
use crate::types::Role;

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model produced an end-of-generation token
    Stop,
    /// The configured `max_tokens` limit was reached
    Length,
}

/// Result of a successful request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub generated_tokens: u32,
}

/// Owns the model session, the conversation and the slot of the server
pub struct GenerationEngine<C, S, P> {
    codec: C,
    session: S,
    sampler: P,
    conversation: Conversation,
    slot: Slot,
    metrics: SharedMetrics,
    /// 0 means unbounded
    max_tokens: u32,
}

fn millis(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_secs_f64() * 1000.0
}

impl<C, S, P> GenerationEngine<C, S, P>
where
    C: TokenCodec,
    S: ModelSession,
    P: SamplingPolicy<S>,
{
    pub fn new(codec: C, session: S, sampler: P, metrics: SharedMetrics) -> Self {
        Self {
            codec,
            session,
            sampler,
            conversation: Conversation::new(),
            slot: Slot::new(0),
            metrics,
            max_tokens: 0,
        }
    }

    /// Limit the number of generated tokens per request (0 = unbounded).
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn sampler(&self) -> &P {
        &self.sampler
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    /// Run one request to a terminal state.
    ///
    /// When a sink is given, every fragment is pushed to it as soon as it is
    /// generated, followed by exactly one `emit_done` or `emit_error`. A sink
    /// whose receiver went away is dropped and generation continues, so the
    /// conversation keeps matching what the model context holds.
    ///
    /// A failed request leaves the conversation as it was before the call.
    pub fn handle_request(
        &mut self,
        prompt: &str,
        mut sink: Option<&mut dyn TokenSink>,
    ) -> Result<Completion, GenerationError> {
        self.slot.begin_request();
        let started = Instant::now();
        let mut prefilled_at = None;
        let history_len = self.conversation.turns().len();

        let result = self.generate(prompt, &mut sink, &mut prefilled_at);

        let ended = Instant::now();
        let split = prefilled_at.unwrap_or(ended);
        self.slot.t_prompt_processing = millis(started, split);
        self.slot.t_token_generation = millis(split, ended);

        match &result {
            Ok(completion) => {
                self.conversation
                    .append_turn(Role::Assistant, completion.text.clone());
                match self.conversation.closed_len(&self.codec) {
                    Ok(len) => self.conversation.advance_boundary(len),
                    Err(e) => tracing::warn!("Conversation boundary not advanced: {e}"),
                }
                self.slot.set_state(SlotState::Idle);
                tracing::info!(
                    prompt_tokens = completion.prompt_tokens,
                    generated_tokens = completion.generated_tokens,
                    finish_reason = ?completion.finish_reason,
                    t_prompt_ms = self.slot.t_prompt_processing,
                    t_generation_ms = self.slot.t_token_generation,
                    "Request completed"
                );
            }
            Err(e) => {
                // The failed prompt must not ride along with the next request.
                self.conversation.truncate(history_len);
                self.slot.set_state(SlotState::Error);
                tracing::warn!(
                    generated_tokens = self.slot.n_decoded,
                    "Request failed: {e}"
                );
            }
        }

        self.record_request(result.is_err());

        if let Some(sink) = sink {
            match &result {
                Ok(_) => sink.emit_done(),
                Err(e) => sink.emit_error(&e.to_string()),
            }
        }

        result
    }

    fn generate(
        &mut self,
        prompt: &str,
        sink: &mut Option<&mut dyn TokenSink>,
        prefilled_at: &mut Option<Instant>,
    ) -> Result<Completion, GenerationError> {
        self.conversation.append_turn(Role::User, prompt);
        let delta = self.conversation.render_delta(&self.codec)?;

        let add_bos = self.session.used_cells() == 0;
        let prompt_tokens = self
            .codec
            .tokenize(&delta.text, add_bos)
            .map_err(|e| GenerationError::new(ErrorKind::TokenizeFailure, e))?;
        if prompt_tokens.is_empty() {
            return Err(GenerationError::new(
                ErrorKind::TokenizeFailure,
                "prompt produced no tokens",
            ));
        }
        tracing::debug!(
            "Tokenized prompt delta of {} bytes into {} tokens (bos: {})",
            delta.text.len(),
            prompt_tokens.len(),
            add_bos
        );

        self.submit(&prompt_tokens)?;
        self.slot.n_prompt_tokens_processed = prompt_tokens.len() as u32;
        *prefilled_at = Some(Instant::now());

        let mut response = String::new();
        let mut utf8 = Utf8Assembler::new();

        let finish_reason = loop {
            if self.max_tokens > 0 && self.slot.n_decoded >= self.max_tokens {
                break FinishReason::Length;
            }

            let token = self.sampler.sample_next(&self.session);
            if self.sampler.is_end_of_generation(token) {
                tracing::debug!("End of generation token encountered");
                break FinishReason::Stop;
            }

            let bytes = self
                .codec
                .token_to_bytes(token)
                .map_err(|e| GenerationError::new(ErrorKind::DetokenizeFailure, e))?;
            if let Some(fragment) = utf8.push(&bytes) {
                Self::emit(sink, &fragment);
                response.push_str(&fragment);
            }

            self.slot.n_decoded += 1;
            self.sampler.accept(token);
            metrics::write(&self.metrics).on_decoded(std::slice::from_ref(&self.slot));

            self.submit(&[token])?;
        };

        if let Some(rest) = utf8.finish() {
            Self::emit(sink, &rest);
            response.push_str(&rest);
        }

        Ok(Completion {
            text: response,
            finish_reason,
            prompt_tokens: self.slot.n_prompt_tokens_processed,
            generated_tokens: self.slot.n_decoded,
        })
    }

    /// Capacity-checked decode of one batch.
    fn submit(&mut self, tokens: &[TokenId]) -> Result<(), GenerationError> {
        let capacity = self.session.capacity();
        let used = self.session.used_cells();
        if used as usize + tokens.len() > capacity as usize {
            return Err(GenerationError::new(
                ErrorKind::ContextExceeded,
                format!(
                    "{} tokens requested, {} of {} context cells free",
                    tokens.len(),
                    capacity.saturating_sub(used),
                    capacity
                ),
            ));
        }

        self.session
            .decode(tokens)
            .map_err(|e| GenerationError::new(ErrorKind::DecodeFailure, e))
    }

    fn emit(sink: &mut Option<&mut dyn TokenSink>, fragment: &str) {
        if let Some(s) = sink.as_deref_mut() {
            if s.emit_fragment(fragment).is_err() {
                tracing::debug!("Receiver dropped, continuing generation without streaming");
                *sink = None;
            }
        }
    }

    fn record_request(&self, failed: bool) {
        let used = self.session.used_cells();
        let mut metrics = metrics::write(&self.metrics);
        metrics.on_prompt_eval(&self.slot);
        metrics.on_prediction(&self.slot);
        metrics.update_kv_cache(used, used);
        metrics.on_request();
        if failed {
            metrics.on_request_failed();
        }
        metrics.on_slot_state(self.slot.state);
    }
}
