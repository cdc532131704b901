//! # RustKit Common
//!
//! Shared plumbing for the RustKit AppCache crates.
//!
//! ## Features
//!
//! - Logging configuration and subscriber setup
//! - Retry with backoff, including server-directed `Retry-After` delays

pub mod logging;
pub mod retry;

pub use logging::{init_logging, init_test_logging, try_init_logging, LogConfig, LogFormat, LogInitError};
pub use retry::{parse_retry_after, retry_with_policy, RetryConfig, RetryDecision};
