//! llama-cpp-2 runtime
//!
//! Implements the codec, session and sampling boundaries on top of llama.cpp and
//! starts the inference worker that owns them. The model and its context borrow
//! the backend, so everything is built inside the worker thread.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{ModelSession, SamplingPolicy, TokenCodec, TokenId};
use crate::inference::engine::{EngineHandle, ModelInfo, WorkerPort};
use crate::inference::error::{BackendError, EngineError};
use crate::inference::generation::GenerationEngine;
use crate::inference::gguf::validate_gguf;
use crate::storage::{SamplingSettings, ServerSettings};
use crate::system::metrics::SharedMetrics;
use crate::types::Turn;

pub type LlamaEngine<'m> =
    GenerationEngine<LlamaCodec<'m>, LlamaSession<'m>, LlamaSamplingPolicy<'m>>;

/// Tokenizer and chat template of a loaded model
pub struct LlamaCodec<'m> {
    model: &'m LlamaModel,
    template: Option<LlamaChatTemplate>,
}

impl<'m> LlamaCodec<'m> {
    pub fn new(model: &'m LlamaModel) -> Self {
        let template = match model.chat_template(None) {
            Ok(template) => Some(template),
            Err(error) => {
                tracing::warn!("Model has no usable chat template, using plain transcript: {error}");
                None
            }
        };
        Self { model, template }
    }
}

/// `role: content` lines, used when the model ships without a chat template
fn plain_transcript(turns: &[Turn], add_generation_prompt: bool) -> String {
    let mut rendered = String::new();
    for turn in turns {
        rendered.push_str(&format!("{}: {}\n", turn.role, turn.content));
    }
    if add_generation_prompt {
        rendered.push_str("assistant: ");
    }
    rendered
}

impl TokenCodec for LlamaCodec<'_> {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        self.model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| BackendError::new(e.to_string()))
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| BackendError::new(e.to_string()))
    }

    fn apply_chat_template(
        &self,
        turns: &[Turn],
        add_generation_prompt: bool,
    ) -> Result<String, BackendError> {
        let Some(template) = &self.template else {
            return Ok(plain_transcript(turns, add_generation_prompt));
        };

        let messages = turns
            .iter()
            .map(|turn| LlamaChatMessage::new(turn.role.to_string(), turn.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::new(format!("Failed to build chat message: {e}")))?;

        self.model
            .apply_chat_template(template, &messages, add_generation_prompt)
            .map_err(|e| BackendError::new(e.to_string()))
    }
}

/// The llama.cpp context of the single server sequence
///
/// Cells are tracked here rather than queried from the KV cache: there is one
/// sequence and nothing is ever evicted, so occupied cells equal decoded tokens.
pub struct LlamaSession<'m> {
    ctx: LlamaContext<'m>,
    n_past: u32,
}

impl<'m> LlamaSession<'m> {
    pub fn new(ctx: LlamaContext<'m>) -> Self {
        Self { ctx, n_past: 0 }
    }
}

impl ModelSession for LlamaSession<'_> {
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        let Some(last) = tokens.len().checked_sub(1) else {
            return Err(BackendError::new("empty batch"));
        };
        if self.n_past as usize + tokens.len() > self.capacity() as usize {
            return Err(BackendError::new("batch does not fit in the context"));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        for (i, token) in tokens.iter().enumerate() {
            let pos = (self.n_past as usize + i) as i32;
            batch
                .add(LlamaToken::new(*token), pos, &[0], i == last)
                .map_err(|e| BackendError::new(format!("Failed to add token to batch: {e}")))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| BackendError::new(e.to_string()))?;
        self.n_past += tokens.len() as u32;
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn used_cells(&self) -> u32 {
        self.n_past
    }
}

/// Sampler chain configured from `SamplingSettings`
pub struct LlamaSamplingPolicy<'m> {
    model: &'m LlamaModel,
    chain: LlamaSampler,
}

impl<'m> LlamaSamplingPolicy<'m> {
    pub fn new(model: &'m LlamaModel, settings: &SamplingSettings) -> Self {
        let chain = if settings.temperature < 0.01 {
            // Use greedy sampling for very low temperature
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::min_p(settings.min_p, 1),
                LlamaSampler::temp(settings.temperature),
                LlamaSampler::dist(settings.seed),
            ])
        };
        Self { model, chain }
    }
}

impl<'m> SamplingPolicy<LlamaSession<'m>> for LlamaSamplingPolicy<'m> {
    fn sample_next(&mut self, session: &LlamaSession<'m>) -> TokenId {
        self.chain.sample(&session.ctx, -1).0
    }

    fn accept(&mut self, _token: TokenId) {
        // `LlamaSampler::sample` already feeds the sampled token to every
        // sampler in the chain.
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }
}

/// Validate the configured model and start the inference worker.
///
/// Blocks until the model is loaded and the context is created.
pub fn spawn(settings: &ServerSettings, metrics: SharedMetrics) -> Result<EngineHandle, EngineError> {
    let path = settings
        .model_path
        .clone()
        .ok_or(EngineError::NoModelConfigured)?;
    validate_gguf(&path)?;

    let settings = settings.clone();
    EngineHandle::spawn(move |port| worker_main(port, path, settings, metrics))
}

fn worker_main(port: WorkerPort, path: PathBuf, settings: ServerSettings, metrics: SharedMetrics) {
    let backend = match LlamaBackend::init() {
        Ok(backend) => backend,
        Err(e) => return port.fail(EngineError::BackendInit(e.to_string())),
    };
    tracing::info!("LlamaBackend initialized in worker thread");

    let model = match load_model(&backend, &path, settings.gpu_layers) {
        Ok(model) => model,
        Err(e) => return port.fail(e),
    };

    let engine = match build_engine(&backend, &model, &settings, metrics) {
        Ok(engine) => engine,
        Err(e) => return port.fail(e),
    };

    let info = ModelInfo {
        path: path.display().to_string(),
        context_size: engine.session().capacity(),
        vocab_size: model.n_vocab(),
        training_context: model.n_ctx_train(),
    };
    port.serve(engine, info);
}

fn load_model(backend: &LlamaBackend, path: &Path, gpu_layers: u32) -> Result<LlamaModel, EngineError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        path.display(),
        model.n_params(),
        model.n_vocab(),
        model.n_ctx_train()
    );
    Ok(model)
}

fn build_engine<'m>(
    backend: &LlamaBackend,
    model: &'m LlamaModel,
    settings: &ServerSettings,
    metrics: SharedMetrics,
) -> Result<LlamaEngine<'m>, EngineError> {
    let n_ctx = NonZeroU32::new(settings.context_size)
        .ok_or_else(|| EngineError::ContextCreate("context size must be positive".to_string()))?;
    if n_ctx.get() > model.n_ctx_train() {
        tracing::warn!(
            "Context size {} exceeds the training context of {}",
            n_ctx,
            model.n_ctx_train()
        );
    }

    // One batch may carry a whole prompt, so the batch is as large as the context.
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(n_ctx.get());
    let ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

    Ok(GenerationEngine::new(
        LlamaCodec::new(model),
        LlamaSession::new(ctx),
        LlamaSamplingPolicy::new(model, &settings.sampling),
        metrics,
    )
    .with_max_tokens(settings.max_tokens))
}
