//! Control-plane request and response messages.
//!
//! These are the already-decoded forms of the module registration RPCs.
//! The admin HTTP surface accepts them as JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::autoscale::ScalingMetrics;
use crate::load_balancer::EndpointSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterModuleRequest {
    pub module_name: String,
    pub protocol: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    /// 0 means "use the configured per-module cap".
    #[serde(default)]
    pub max_conns: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterModuleResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterModuleRequest {
    pub module_name: String,
    pub protocol: String,
}

/// Plain success/message reply shared by the simpler calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthUpdateRequest {
    pub module_name: String,
    pub healthy: bool,
    /// Reporter's clock, Unix seconds. Informational only.
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRequest {
    #[serde(default)]
    pub include_modules: bool,
    #[serde(default)]
    pub include_metrics: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Unix seconds.
    pub timestamp: i64,
    pub total_modules: usize,
    pub healthy_modules: usize,
    pub total_conns: usize,
    pub stats: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<EndpointSnapshot>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetricsRequest {
    pub protocol: String,
    #[serde(flatten)]
    pub metrics: ScalingMetrics,
}
