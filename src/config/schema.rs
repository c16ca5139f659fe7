//! Configuration schema definitions.
//!
//! Every section and field is optional; a missing value takes its default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::autoscale::{AutoscalerSettings, ScalingPolicy};
use crate::deploy::RolloutSettings;
use crate::inspector::{parse_protocol, Protocol};
use crate::load_balancer::RegistryLimits;
use crate::rpc::ClientSettings;

/// Root configuration for the balancer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NlbConfig {
    pub admin: AdminConfig,
    pub observability: ObservabilityConfig,
    pub rate_limit: RateLimitConfig,
    pub autoscale: AutoscaleConfig,
    pub blue_green: BlueGreenConfig,
    pub modules: ModulesConfig,
    pub lifecycle: LifecycleConfig,
}

/// Admin/control-plane HTTP surface.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    pub bind_address: String,

    /// Bearer token for mutating `/v1` routes. Empty leaves them open.
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8082".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Install the Prometheus recorder and serve `/metrics`.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
        }
    }
}

/// An explicit token bucket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BucketConfig {
    pub name: String,
    pub protocol: String,
    pub capacity: f64,
    pub refill_rate: f64,
}

impl BucketConfig {
    pub fn protocol(&self) -> Protocol {
        parse_protocol(&self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Tokens per second for per-protocol default buckets.
    pub default_refill_rate: f64,

    pub default_capacity: f64,

    /// Create one bucket per known protocol, named after it (`"http"`, ...).
    pub per_protocol_defaults: bool,

    /// Explicit buckets. A bucket named like a default replaces it.
    pub buckets: Vec<BucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_refill_rate: 10_000.0,
            default_capacity: 20_000.0,
            per_protocol_defaults: true,
            buckets: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Every bucket this section describes, defaults first.
    pub fn effective_buckets(&self) -> Vec<BucketConfig> {
        let mut out: Vec<BucketConfig> = Vec::new();
        if self.per_protocol_defaults {
            out.extend(Protocol::ALL.iter().map(|p| BucketConfig {
                name: p.bucket_key(),
                protocol: p.as_str().to_string(),
                capacity: self.default_capacity,
                refill_rate: self.default_refill_rate,
            }));
        }
        for bucket in &self.buckets {
            out.retain(|b| b.name != bucket.name);
            out.push(bucket.clone());
        }
        out
    }
}

/// Per-protocol override of the default scaling policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PolicyConfig {
    pub protocol: String,
    pub min_replicas: Option<usize>,
    pub max_replicas: Option<usize>,
    pub target_cpu: Option<f64>,
    pub target_memory: Option<f64>,
    pub target_conn_per_replica: Option<u64>,
    pub scale_up_threshold: Option<f64>,
    pub scale_down_threshold: Option<f64>,
    pub evaluation_periods: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    pub max_history: usize,
    pub policies: Vec<PolicyConfig>,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            scale_up_cooldown_secs: 180,
            scale_down_cooldown_secs: 300,
            max_history: 100,
            policies: Vec::new(),
        }
    }
}

impl AutoscaleConfig {
    pub fn settings(&self) -> AutoscalerSettings {
        AutoscalerSettings {
            interval: Duration::from_secs(self.interval_secs),
            max_history: self.max_history,
        }
    }

    /// Default policy for `protocol` with this section's cooldowns applied.
    pub fn base_policy(&self, protocol: Protocol) -> ScalingPolicy {
        ScalingPolicy {
            scale_up_cooldown: Duration::from_secs(self.scale_up_cooldown_secs),
            scale_down_cooldown: Duration::from_secs(self.scale_down_cooldown_secs),
            ..ScalingPolicy::default_for(protocol)
        }
    }

    /// Resolve an override entry into a full policy.
    pub fn resolve(&self, entry: &PolicyConfig) -> ScalingPolicy {
        let base = self.base_policy(parse_protocol(&entry.protocol));
        ScalingPolicy {
            min_replicas: entry.min_replicas.unwrap_or(base.min_replicas),
            max_replicas: entry.max_replicas.unwrap_or(base.max_replicas),
            target_cpu: entry.target_cpu.unwrap_or(base.target_cpu),
            target_memory: entry.target_memory.unwrap_or(base.target_memory),
            target_conn_per_replica: entry
                .target_conn_per_replica
                .unwrap_or(base.target_conn_per_replica),
            scale_up_threshold: entry.scale_up_threshold.unwrap_or(base.scale_up_threshold),
            scale_down_threshold: entry.scale_down_threshold.unwrap_or(base.scale_down_threshold),
            evaluation_periods: entry.evaluation_periods.unwrap_or(base.evaluation_periods),
            ..base
        }
    }

    /// One policy per known protocol, overrides applied.
    pub fn effective_policies(&self) -> Vec<ScalingPolicy> {
        Protocol::ALL
            .iter()
            .map(|p| {
                self.policies
                    .iter()
                    .rev()
                    .find(|entry| parse_protocol(&entry.protocol) == *p)
                    .map_or_else(|| self.base_policy(*p), |entry| self.resolve(entry))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BlueGreenConfig {
    pub enabled: bool,
    pub step_size: u32,
    pub step_duration_secs: u64,
    pub tick_interval_ms: u64,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            step_size: 10,
            step_duration_secs: 120,
            tick_interval_ms: 1000,
        }
    }
}

impl BlueGreenConfig {
    pub fn settings(&self) -> RolloutSettings {
        RolloutSettings {
            step_size: self.step_size,
            step_duration: Duration::from_secs(self.step_duration_secs),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub max_modules_per_protocol: usize,

    /// Cap on a registration's `max_conns`; 0 in a registration means this cap.
    pub max_connections_per_module: usize,

    pub health_check_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            max_modules_per_protocol: 50,
            max_connections_per_module: 10_000,
            health_check_interval_secs: 10,
            connect_timeout_secs: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl ModulesConfig {
    pub fn limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_modules_per_protocol: self.max_modules_per_protocol,
            max_connections_per_module: self.max_connections_per_module,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub shutdown_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: 30,
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
