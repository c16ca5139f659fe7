//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, env overrides)
//!     → validation.rs (semantic checks, all errors at once)
//!     → NlbConfig (validated)
//!     → component settings derived per section
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads and validates
//!     → Nlb::apply_config (buckets replaced, policies re-set)
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Only rate-limit buckets and scaling policies hot reload; everything
//!   else needs a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, AutoscaleConfig, BlueGreenConfig, BucketConfig, LifecycleConfig, LogFormat,
    ModulesConfig, NlbConfig, ObservabilityConfig, PolicyConfig, RateLimitConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
