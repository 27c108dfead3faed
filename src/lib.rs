//! slotserve
//!
//! Single-slot HTTP inference server for GGUF models: one model session, one
//! growing conversation, streamed or buffered completions and live metrics.

pub mod inference;
pub mod server;
pub mod storage;
pub mod system;
pub mod types;
