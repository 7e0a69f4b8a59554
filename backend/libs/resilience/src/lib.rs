//! Resilience patterns for long-lived broker connections
//!
//! This library provides the restart policy used by supervised consumer streams:
//! - **Exponential backoff**: `min(max, min * 2^attempt)` stretched by random jitter
//! - **Restart tracking**: attempt counter that resets after a sustained healthy run
//!
//! # Example: Restart delay for a failed stream
//!
//! ```rust,no_run
//! use resilience::{ExponentialBackoff, RestartBackoff};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = ExponentialBackoff::new(
//!         Duration::from_secs(1),
//!         Duration::from_secs(30),
//!         0.2,
//!     )
//!     .expect("valid backoff");
//!     let mut backoff = RestartBackoff::new(policy);
//!
//!     backoff.record_start();
//!     // ... the stream fails ...
//!     tokio::time::sleep(backoff.next_delay()).await;
//! }
//! ```

pub mod backoff;

pub use backoff::{BackoffError, ExponentialBackoff, RestartBackoff};
