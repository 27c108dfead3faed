//! Server performance metrics
//!
//! Counters fed by the generation engine and a snapshot with derived rates for
//! the `/metrics` endpoint. Lifetime totals only ever grow; the "bucket" fields
//! hold the values of the most recently completed request.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::inference::slot::{Slot, SlotState};

/// Metrics shared between the inference worker (writer) and HTTP handlers (readers)
pub type SharedMetrics = Arc<RwLock<ServerMetrics>>;

/// Read access that survives a panicked writer
pub fn read(metrics: &SharedMetrics) -> RwLockReadGuard<'_, ServerMetrics> {
    metrics.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write(metrics: &SharedMetrics) -> RwLockWriteGuard<'_, ServerMetrics> {
    metrics.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct ServerMetrics {
    started: Instant,

    n_prompt_tokens_processed_total: u64,
    t_prompt_processing_total: f64,
    n_tokens_predicted_total: u64,
    t_tokens_generation_total: f64,

    n_prompt_tokens_processed: u64,
    t_prompt_processing: f64,
    n_tokens_predicted: u64,
    t_tokens_generation: f64,

    n_decode_total: u64,
    n_busy_slots_total: u64,
    n_requests_total: u64,
    n_requests_failed: u64,

    kv_cache_tokens_count: u64,
    kv_cache_used_cells: u64,

    slot_state: SlotState,
}

/// Point-in-time view served by `GET /metrics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub tokens_per_second: f64,
    pub avg_prompt_latency_ms: f64,
    pub avg_generation_latency_ms: f64,
    pub busy_slots_ratio: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub kv_cache_tokens: u64,
    pub kv_cache_used_cells: u64,
    pub total_prompt_tokens: u64,
    pub total_generated_tokens: u64,
    pub total_decode_calls: u64,
    pub slot_state: SlotState,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            n_prompt_tokens_processed_total: 0,
            t_prompt_processing_total: 0.0,
            n_tokens_predicted_total: 0,
            t_tokens_generation_total: 0.0,
            n_prompt_tokens_processed: 0,
            t_prompt_processing: 0.0,
            n_tokens_predicted: 0,
            t_tokens_generation: 0.0,
            n_decode_total: 0,
            n_busy_slots_total: 0,
            n_requests_total: 0,
            n_requests_failed: 0,
            kv_cache_tokens_count: 0,
            kv_cache_used_cells: 0,
            slot_state: SlotState::Idle,
        }
    }

    pub fn shared() -> SharedMetrics {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record the prompt phase. Empty or instantaneous phases are skipped so the
    /// latency averages never divide by zero.
    pub fn on_prompt_eval(&mut self, slot: &Slot) {
        if slot.n_prompt_tokens_processed > 0 && slot.t_prompt_processing > 0.0 {
            self.n_prompt_tokens_processed = u64::from(slot.n_prompt_tokens_processed);
            self.t_prompt_processing = slot.t_prompt_processing;

            self.n_prompt_tokens_processed_total += u64::from(slot.n_prompt_tokens_processed);
            self.t_prompt_processing_total += slot.t_prompt_processing;
        }
    }

    /// Record the generation phase. Zero generated tokens is a valid outcome.
    pub fn on_prediction(&mut self, slot: &Slot) {
        self.n_tokens_predicted = u64::from(slot.n_decoded);
        self.t_tokens_generation = slot.t_token_generation;

        self.n_tokens_predicted_total += u64::from(slot.n_decoded);
        self.t_tokens_generation_total += slot.t_token_generation;
    }

    /// Called once per generated token.
    pub fn on_decoded(&mut self, slots: &[Slot]) {
        self.n_decode_total += 1;
        self.n_busy_slots_total += slots.iter().filter(|s| s.is_processing()).count() as u64;
    }

    pub fn on_request(&mut self) {
        self.n_requests_total += 1;
    }

    pub fn on_request_failed(&mut self) {
        self.n_requests_failed += 1;
    }

    pub fn update_kv_cache(&mut self, tokens: u32, used_cells: u32) {
        self.kv_cache_tokens_count = u64::from(tokens);
        self.kv_cache_used_cells = u64::from(used_cells);
    }

    pub fn on_slot_state(&mut self, state: SlotState) {
        self.slot_state = state;
    }

    pub fn slot_state(&self) -> SlotState {
        self.slot_state
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Derived view as of `now`; never mutates the counters.
    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let requests = self.n_requests_total as f64;
        MetricsSnapshot {
            uptime_seconds: now.saturating_duration_since(self.started).as_secs_f64(),
            tokens_per_second: ratio(
                self.n_tokens_predicted as f64 * 1000.0,
                self.t_tokens_generation,
            ),
            avg_prompt_latency_ms: ratio(
                self.t_prompt_processing,
                self.n_prompt_tokens_processed as f64,
            ),
            avg_generation_latency_ms: ratio(
                self.t_tokens_generation,
                self.n_tokens_predicted as f64,
            ),
            busy_slots_ratio: ratio(self.n_busy_slots_total as f64, self.n_decode_total as f64),
            total_requests: self.n_requests_total,
            failed_requests: self.n_requests_failed,
            success_rate: ratio(
                self.n_requests_total.saturating_sub(self.n_requests_failed) as f64,
                requests,
            ),
            kv_cache_tokens: self.kv_cache_tokens_count,
            kv_cache_used_cells: self.kv_cache_used_cells,
            total_prompt_tokens: self.n_prompt_tokens_processed_total,
            total_generated_tokens: self.n_tokens_predicted_total,
            total_decode_calls: self.n_decode_total,
            slot_state: self.slot_state,
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
