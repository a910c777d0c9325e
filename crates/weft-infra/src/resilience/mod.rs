//! Resilience patterns for infrastructure calls

pub mod retry;

pub use retry::{retry_with, RetryConfig, RetryPolicy};
