//! Processing slot
//!
//! The server has exactly one slot. It tracks the state and counters of the
//! request currently being processed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    #[default]
    Idle,
    Processing,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub id: u32,
    pub state: SlotState,
    /// Prompt tokens evaluated by this request
    pub n_prompt_tokens_processed: u32,
    /// Tokens generated and emitted by this request
    pub n_decoded: u32,
    /// Prompt phase duration in milliseconds
    pub t_prompt_processing: f64,
    /// Generation phase duration in milliseconds
    pub t_token_generation: f64,
}

impl Slot {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn is_processing(&self) -> bool {
        self.state == SlotState::Processing
    }

    pub fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }

    /// Enter processing with fresh per-request counters.
    ///
    /// A slot left in `Error` by the previous request goes straight to processing.
    pub fn begin_request(&mut self) {
        self.state = SlotState::Processing;
        self.n_prompt_tokens_processed = 0;
        self.n_decoded = 0;
        self.t_prompt_processing = 0.0;
        self.t_token_generation = 0.0;
    }
}
