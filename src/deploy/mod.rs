//! Blue/green and canary deployment subsystem.
//!
//! # Data Flow
//! ```text
//! Operator:
//!     initialize → DeploymentState (100% blue, stable)
//!     canary     → status canary, stepper task spawned
//!     switch     → 100/0 or 0/100 in one update, stable
//!     rollback   → complement of the active color at 100%, rollback
//!
//! Stepper (one per rollout, every tick):
//!     → wait until step_duration since the last update
//!     → move the target color's weight up by step_size (clamped)
//!     → targets reached: stable, active color = the one at 100
//!     → step error: automatic rollback
//!
//! Routing:
//!     random 0..100 < blue_weight → blue, else green
//! ```
//!
//! # Design Decisions
//! - State transitions live on `DeploymentState` and take the clock as input
//! - Weights always sum to 100
//! - Deployments are never deleted, only re-initialized

pub mod controller;
pub mod state;

pub use controller::{BlueGreenController, DeployStats, RolloutSettings};
pub use state::{DeployError, DeploymentColor, DeploymentState, DeploymentStatus, StepOutcome};
