//! Autoscaling subsystem.
//!
//! # Data Flow
//! ```text
//! Control plane reports ScalingMetrics
//!     → scaler.rs (bounded per-protocol sample history)
//!
//! Every interval:
//!     → average the last `evaluation_periods` samples
//!     → pressure = max(cpu, memory, connections per replica) / target
//!     → scale_up / scale_down / none (cooldown and min/max gated)
//!     → history + metrics + ScaleDecisionHandler (orchestrator)
//! ```
//!
//! # Design Decisions
//! - Decisions only; provisioning belongs to the orchestrator
//! - One replica per action
//! - A single cooldown clock per protocol, with separate up and down lengths
//! - Handler failures are logged, never propagated into routing

pub mod policy;
pub mod scaler;

pub use policy::{
    AutoscaleError, ScaleDecision, ScaleDirection, ScalingHistory, ScalingMetrics, ScalingPolicy,
};
pub use scaler::{
    Autoscaler, AutoscalerSettings, AutoscalerStats, ChannelNotifier, ReplicaSource,
    ScaleDecisionHandler, ScaleEvent, ScaleHandlerError,
};
