//! Application state shared across handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::inference::EngineHandle;
use crate::system::SharedMetrics;

#[derive(Clone)]
pub struct AppState {
    /// The single-slot inference worker
    pub engine: Arc<EngineHandle>,
    /// Counters written by the worker, read by `/metrics` and `/health`
    pub metrics: SharedMetrics,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: EngineHandle, metrics: SharedMetrics) -> Self {
        Self {
            engine: Arc::new(engine),
            metrics,
            started_at: Utc::now(),
        }
    }
}
