//! Deterministic in-process runtime
//!
//! A byte-level codec, a bounded session and a scripted sampler. Used by the
//! test suites and handy for exercising the HTTP layer without a GGUF file.

use crate::inference::backend::{ModelSession, SamplingPolicy, TokenCodec, TokenId};
use crate::inference::engine::{EngineHandle, ModelInfo};
use crate::inference::error::{BackendError, EngineError};
use crate::inference::generation::GenerationEngine;
use crate::system::metrics::{ServerMetrics, SharedMetrics};
use crate::types::Turn;

pub const BOS_TOKEN: TokenId = 1;
pub const EOS_TOKEN: TokenId = 2;
/// Byte `b` is token `b + BYTE_OFFSET`.
pub const BYTE_OFFSET: TokenId = 3;

pub type MockEngine = GenerationEngine<MockCodec, MockSession, MockSampler>;

/// Byte-level tokenizer with a tiny tag-based chat template
#[derive(Debug, Clone, Default)]
pub struct MockCodec {
    fail_template: bool,
    fail_tokenize: bool,
}

impl MockCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_template() -> Self {
        Self {
            fail_template: true,
            ..Self::default()
        }
    }

    pub fn failing_tokenizer() -> Self {
        Self {
            fail_tokenize: true,
            ..Self::default()
        }
    }
}

/// Tokens for `text` without a BOS marker
pub fn text_tokens(text: &str) -> Vec<TokenId> {
    text.bytes().map(|b| TokenId::from(b) + BYTE_OFFSET).collect()
}

impl TokenCodec for MockCodec {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        if self.fail_tokenize {
            return Err(BackendError::new("tokenizer unavailable"));
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text_tokens(text));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        match token {
            BOS_TOKEN | EOS_TOKEN => Ok(Vec::new()),
            t if (BYTE_OFFSET..BYTE_OFFSET + 256).contains(&t) => Ok(vec![(t - BYTE_OFFSET) as u8]),
            t => Err(BackendError::new(format!("unknown token id {t}"))),
        }
    }

    fn apply_chat_template(
        &self,
        turns: &[Turn],
        add_generation_prompt: bool,
    ) -> Result<String, BackendError> {
        if self.fail_template {
            return Err(BackendError::new("no chat template"));
        }
        let mut rendered = String::new();
        for turn in turns {
            rendered.push_str(&format!("<|{}|>{}\n", turn.role, turn.content));
        }
        if add_generation_prompt {
            rendered.push_str("<|assistant|>");
        }
        Ok(rendered)
    }
}

/// Context buffer that only counts cells and records every decoded batch
#[derive(Debug, Clone)]
pub struct MockSession {
    capacity: u32,
    used: u32,
    batches: Vec<Vec<TokenId>>,
    fail_on_call: Option<usize>,
}

impl MockSession {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            used: 0,
            batches: Vec::new(),
            fail_on_call: None,
        }
    }

    /// Make the `n`-th decode call (0-based) fail.
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Every successfully decoded batch, in order
    pub fn batches(&self) -> &[Vec<TokenId>] {
        &self.batches
    }
}

impl ModelSession for MockSession {
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        if self.fail_on_call == Some(self.batches.len()) {
            self.fail_on_call = None;
            return Err(BackendError::new("decode returned 1"));
        }
        let needed = self.used as usize + tokens.len();
        if tokens.is_empty() || needed > self.capacity as usize {
            return Err(BackendError::new(format!(
                "cannot place {} tokens with {} of {} cells used",
                tokens.len(),
                self.used,
                self.capacity
            )));
        }
        self.used = needed as u32;
        self.batches.push(tokens.to_vec());
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn used_cells(&self) -> u32 {
        self.used
    }
}

/// Replays scripted replies, one per request, cycling when exhausted
#[derive(Debug, Clone)]
pub struct MockSampler {
    replies: Vec<Vec<TokenId>>,
    reply: usize,
    cursor: usize,
    accepted: Vec<TokenId>,
}

impl MockSampler {
    /// Each reply is emitted byte by byte and terminated by `EOS_TOKEN`.
    pub fn replying(replies: &[&str]) -> Self {
        Self::from_tokens(replies.iter().map(|r| text_tokens(r)).collect())
    }

    /// Raw token scripts; `EOS_TOKEN` is sampled once a script runs out.
    pub fn from_tokens(replies: Vec<Vec<TokenId>>) -> Self {
        Self {
            replies,
            reply: 0,
            cursor: 0,
            accepted: Vec::new(),
        }
    }

    pub fn accepted(&self) -> &[TokenId] {
        &self.accepted
    }
}

impl SamplingPolicy<MockSession> for MockSampler {
    fn sample_next(&mut self, _session: &MockSession) -> TokenId {
        let token = self
            .replies
            .get(self.reply)
            .and_then(|script| script.get(self.cursor))
            .copied()
            .unwrap_or(EOS_TOKEN);
        self.cursor += 1;
        if token == EOS_TOKEN && !self.replies.is_empty() {
            self.reply = (self.reply + 1) % self.replies.len();
            self.cursor = 0;
        }
        token
    }

    fn accept(&mut self, token: TokenId) {
        self.accepted.push(token);
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS_TOKEN
    }
}

/// Build an engine with a fresh mock runtime.
pub fn engine(capacity: u32, replies: &[&str], metrics: SharedMetrics) -> MockEngine {
    GenerationEngine::new(
        MockCodec::new(),
        MockSession::new(capacity),
        MockSampler::replying(replies),
        metrics,
    )
}

/// Start a worker thread serving a mock engine.
pub fn spawn(
    capacity: u32,
    replies: &[&str],
    metrics: SharedMetrics,
) -> Result<EngineHandle, EngineError> {
    let replies: Vec<String> = replies.iter().map(|r| r.to_string()).collect();
    EngineHandle::spawn(move |port| {
        let replies: Vec<&str> = replies.iter().map(String::as_str).collect();
        let engine = engine(capacity, &replies, metrics);
        let info = ModelInfo {
            path: "mock".to_string(),
            context_size: capacity,
            vocab_size: 256 + BYTE_OFFSET,
            training_context: capacity,
        };
        port.serve(engine, info);
    })
}

/// Metrics store for tests
pub fn metrics() -> SharedMetrics {
    ServerMetrics::shared()
}
