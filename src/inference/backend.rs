//! Runtime boundaries
//!
//! The generation engine reaches the model only through these traits.
//! `inference::llama` implements them on llama-cpp-2 and `inference::mock`
//! provides a deterministic runtime for tests.

use crate::inference::error::BackendError;
use crate::types::Turn;

/// Model vocabulary id
pub type TokenId = i32;

/// Text to token conversion and chat templating
pub trait TokenCodec {
    /// Tokenize `text`, prepending the beginning-of-sequence marker when `add_bos` is set.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Raw bytes of one token. A token may end in the middle of a UTF-8 sequence.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;

    /// Render `turns` with the model's chat template.
    fn apply_chat_template(
        &self,
        turns: &[Turn],
        add_generation_prompt: bool,
    ) -> Result<String, BackendError>;
}

/// The fixed-capacity context buffer (KV cache) of the loaded model
pub trait ModelSession {
    /// Evaluate `tokens` at the next positions of the sequence.
    ///
    /// On success `used_cells` grows by `tokens.len()`. Callers must ensure
    /// `used_cells() + tokens.len() <= capacity()`.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError>;

    fn capacity(&self) -> u32;

    fn used_cells(&self) -> u32;
}

/// Next-token selection over the logits of the last decoded position
pub trait SamplingPolicy<S: ModelSession + ?Sized> {
    fn sample_next(&mut self, session: &S) -> TokenId;

    /// Feed an emitted token back into the repetition/penalty history.
    fn accept(&mut self, token: TokenId);

    fn is_end_of_generation(&self, token: TokenId) -> bool;
}
