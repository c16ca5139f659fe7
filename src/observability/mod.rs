//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (structured key/value logs)
//!     → MetricsSink (counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus recorder, scraped via the admin /metrics route
//!     → RecordingSink in tests
//! ```
//!
//! # Design Decisions
//! - The sink is injected at construction; no component touches a global
//!   recorder directly
//! - Metric names and labels are constants in `metrics.rs`

pub mod logging;
pub mod metrics;

pub use metrics::{MetricsSink, NoopSink, PrometheusSink, RecordingSink, SharedSink};
