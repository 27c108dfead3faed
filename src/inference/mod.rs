//! LLM inference engine
//!
//! The generation engine and its conversation/slot state are written against
//! three boundary traits (`TokenCodec`, `ModelSession`, `SamplingPolicy`).
//! `llama` implements them with llama-cpp-2, `mock` with a deterministic
//! byte-level runtime.

pub mod backend;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod generation;
pub mod gguf;
pub mod llama;
pub mod mock;
pub mod slot;
pub mod streaming;

// Re-export main types for convenience
pub use backend::{ModelSession, SamplingPolicy, TokenCodec, TokenId};
pub use conversation::{Conversation, PromptDelta};
pub use engine::{EngineHandle, ModelInfo, WorkerPort};
pub use error::{BackendError, EngineError, ErrorKind, GenerationError};
pub use generation::{Completion, FinishReason, GenerationEngine};
pub use gguf::{validate_gguf, GgufError, GgufHeader, GGUF_MAGIC};
pub use slot::{Slot, SlotState};
pub use streaming::{StreamToken, TokenSink, Utf8Assembler};
