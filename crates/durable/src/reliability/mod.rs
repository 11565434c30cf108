//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - backoff for redelivering already computed results

mod retry;

pub use retry::RetryPolicy;
