//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Detected protocol:
//!     → rate_limit.rs (take a token from the protocol's bucket)
//!     → allowed: continue to routing
//!     → denied: reject the connection
//! ```
//!
//! # Design Decisions
//! - One bucket per protocol or service, not per connection
//! - Unconfigured buckets fail open so new protocols are never blocked
//! - Per-bucket locks; the bucket map lock is held only for lookup

pub mod rate_limit;

pub use rate_limit::{BucketStats, RateLimiter, TokenBucket};
