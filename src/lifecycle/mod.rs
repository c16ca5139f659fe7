//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Logging + recorder → Nlb → loops → admin server
//!
//! Background work (supervisor.rs):
//!     every loop is a BackgroundTask with its own stop signal
//!
//! Shutdown:
//!     SIGINT/SIGTERM (signals.rs) → stop admin + reload task
//!     → Nlb::stop joins autoscaler, client pool, rollout steppers
//! ```
//!
//! # Design Decisions
//! - Shutdown has a timeout: stragglers are aborted after the deadline
//! - No task outlives the balancer

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod supervisor;

pub use shutdown::Shutdown;
pub use startup::{run, run_until, StartupError};
pub use supervisor::{stop_all, BackgroundTask, StopOutcome};
