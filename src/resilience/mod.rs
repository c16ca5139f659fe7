//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Module client connect fails:
//!     → backoff.rs (next delay: doubling, capped, jittered)
//!     → health loop skips the client until the delay has passed
//!     → success resets the schedule
//! ```
//!
//! # Design Decisions
//! - Every dial has a deadline (the client's connect timeout)
//! - Jitter keeps clients that failed together from redialing together

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
