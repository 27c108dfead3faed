//! Runtime monitoring
//!
//! Tracks server throughput, latency and KV-cache occupancy.

pub mod metrics;

pub use metrics::{MetricsSnapshot, ServerMetrics, SharedMetrics};
