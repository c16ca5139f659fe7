//! Scaling policy, metric samples and history records.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inspector::Protocol;

/// Errors from autoscaler configuration and control.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutoscaleError {
    #[error("invalid scaling policy for {protocol}: {reason}")]
    InvalidPolicy { protocol: Protocol, reason: String },

    #[error("autoscaler already running")]
    AlreadyRunning,
}

/// Per-protocol scaling behaviour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingPolicy {
    pub protocol: Protocol,
    pub min_replicas: usize,
    pub max_replicas: usize,
    /// Target CPU utilisation, percent.
    pub target_cpu: f64,
    /// Target memory utilisation, percent.
    pub target_memory: f64,
    pub target_conn_per_replica: u64,
    /// Scale up when pressure reaches this ratio.
    pub scale_up_threshold: f64,
    /// Scale down when pressure falls to this ratio.
    pub scale_down_threshold: f64,
    #[serde(with = "duration_secs")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "duration_secs")]
    pub scale_down_cooldown: Duration,
    /// Samples required before any decision is made.
    pub evaluation_periods: usize,
}

impl ScalingPolicy {
    pub fn default_for(protocol: Protocol) -> Self {
        Self {
            protocol,
            min_replicas: 1,
            max_replicas: 10,
            target_cpu: 70.0,
            target_memory: 80.0,
            target_conn_per_replica: 1000,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(180),
            scale_down_cooldown: Duration::from_secs(300),
            evaluation_periods: 3,
        }
    }

    pub fn validate(&self) -> Result<(), AutoscaleError> {
        let fail = |reason: &str| {
            Err(AutoscaleError::InvalidPolicy {
                protocol: self.protocol,
                reason: reason.to_string(),
            })
        };

        if !self.protocol.is_known() {
            return fail("protocol must be known");
        }
        if self.max_replicas < self.min_replicas {
            return fail("max_replicas must be >= min_replicas");
        }
        if self.max_replicas == 0 {
            return fail("max_replicas must be positive");
        }
        if !(self.target_cpu > 0.0) || !(self.target_memory > 0.0) {
            return fail("CPU and memory targets must be positive");
        }
        if self.target_conn_per_replica == 0 {
            return fail("target_conn_per_replica must be positive");
        }
        if !(self.scale_up_threshold > 0.0) || !(self.scale_down_threshold > 0.0) {
            return fail("thresholds must be positive");
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return fail("scale_down_threshold must be below scale_up_threshold");
        }
        if self.evaluation_periods == 0 {
            return fail("evaluation_periods must be at least 1");
        }
        Ok(())
    }
}

/// One observation reported for a protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    #[serde(default)]
    pub cpu_utilization: f64,
    #[serde(default)]
    pub memory_utilization: f64,
    #[serde(default)]
    pub connection_count: u64,
    #[serde(default)]
    pub request_rate: f64,
    #[serde(default)]
    pub error_rate: f64,
    /// Stamped on receipt; any client-supplied value is overwritten.
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl ScaleDirection {
    /// `direction` label on `nlb_scale_operations_total`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
        }
    }
}

/// Outcome of evaluating one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDecision {
    ScaleUp,
    ScaleDown,
    None,
    InsufficientData,
}

impl ScaleDecision {
    /// `decision` label on `nlb_scale_decisions_total`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDecision::ScaleUp => "scale_up",
            ScaleDecision::ScaleDown => "scale_down",
            ScaleDecision::None => "none",
            ScaleDecision::InsufficientData => "insufficient_data",
        }
    }

    pub fn direction(&self) -> Option<ScaleDirection> {
        match self {
            ScaleDecision::ScaleUp => Some(ScaleDirection::Up),
            ScaleDecision::ScaleDown => Some(ScaleDirection::Down),
            _ => None,
        }
    }
}

/// Audit record of one executed scale action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScalingHistory {
    pub timestamp_ms: u64,
    pub protocol: Protocol,
    pub direction: ScaleDirection,
    pub from: usize,
    pub to: usize,
    pub reason: String,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        for protocol in Protocol::ALL {
            assert_eq!(ScalingPolicy::default_for(protocol).validate(), Ok(()));
        }
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        let mut p = ScalingPolicy::default_for(Protocol::Http);
        p.min_replicas = 5;
        p.max_replicas = 2;
        assert!(matches!(p.validate(), Err(AutoscaleError::InvalidPolicy { .. })));

        let mut p = ScalingPolicy::default_for(Protocol::Http);
        p.target_cpu = 0.0;
        assert!(p.validate().is_err());

        let mut p = ScalingPolicy::default_for(Protocol::Http);
        p.scale_down_threshold = 0.9;
        assert!(p.validate().is_err());

        let mut p = ScalingPolicy::default_for(Protocol::Http);
        p.scale_up_threshold = f64::NAN;
        assert!(p.validate().is_err());

        assert!(ScalingPolicy::default_for(Protocol::Unknown).validate().is_err());
    }
}
