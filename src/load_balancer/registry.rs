//! Module registry and connection router.
//!
//! # Responsibilities
//! - Own every registered module endpoint, sharded by protocol
//! - Route new connections to the least-loaded healthy module
//! - Hand back value snapshots, never live references
//! - Emit routing metrics

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;

use crate::inspector::{InspectError, Protocol, ProtocolInspector};
use crate::load_balancer::endpoint::{EndpointSnapshot, ModuleEndpoint, ModuleSpec};
use crate::load_balancer::least_conn::LeastConnections;
use crate::load_balancer::LoadBalancer;
use crate::observability::metrics::{self as m, SharedSink};

/// Errors from registry mutations and lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("cannot register module for unknown protocol")]
    UnknownProtocol,

    #[error("module {name} already registered for {protocol}")]
    DuplicateModule { protocol: Protocol, name: String },

    #[error("module {name} not found for {protocol}")]
    ModuleNotFound { protocol: Protocol, name: String },

    #[error("module {0} not found for any protocol")]
    ModuleNameNotFound(String),

    #[error("{protocol} already has the maximum of {limit} modules")]
    TooManyModules { protocol: Protocol, limit: usize },

    #[error("module name must not be empty")]
    EmptyName,
}

/// Per-call routing failures. None of these are fatal to the balancer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// Retryable: buffer more bytes and route again.
    #[error(transparent)]
    Inspect(#[from] InspectError),

    #[error("protocol could not be identified")]
    ProtocolUnknown,

    #[error("no modules registered for {0}")]
    NoModulesRegistered(Protocol),

    #[error("no healthy modules for {0}")]
    NoHealthyModules(Protocol),

    #[error("all modules for {0} are at max connections")]
    CapacityExceeded(Protocol),
}

impl RouteError {
    /// Value of the `error_type` label on `nlb_routing_errors_total`.
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::Inspect(_) => "detection_error",
            RouteError::ProtocolUnknown => "unknown_protocol",
            RouteError::NoModulesRegistered(_) | RouteError::NoHealthyModules(_) => "no_module",
            RouteError::CapacityExceeded(_) => "max_connections",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RouteError::Inspect(_))
    }
}

/// Registration caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_modules_per_protocol: usize,
    pub max_connections_per_module: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_modules_per_protocol: 50,
            max_connections_per_module: 10_000,
        }
    }
}

/// Aggregate counters for one protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolStats {
    pub modules: usize,
    pub healthy_modules: usize,
    pub active_connections: usize,
    pub capacity: usize,
}

/// Registry-wide stats, copied out under the read lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub total_modules: usize,
    pub healthy_modules: usize,
    pub total_connections: usize,
    pub protocols: BTreeMap<Protocol, ProtocolStats>,
}

/// Holds one connection slot on a routed endpoint.
///
/// Dropping the guard (or calling [`release`](Self::release)) reports the
/// connection closed. [`detach`](Self::detach) hands that duty back to the
/// caller, who must later call [`Router::decrement_conns`].
pub struct ConnectionGuard {
    endpoint: Arc<ModuleEndpoint>,
    snapshot: EndpointSnapshot,
    metrics: SharedSink,
    armed: bool,
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("endpoint", &self.snapshot)
            .field("armed", &self.armed)
            .finish()
    }
}

impl ConnectionGuard {
    /// The endpoint as it was at selection time.
    pub fn endpoint(&self) -> &EndpointSnapshot {
        &self.snapshot
    }

    pub fn release(mut self) {
        self.close();
    }

    pub fn detach(mut self) -> EndpointSnapshot {
        self.armed = false;
        self.snapshot.clone()
    }

    fn close(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let remaining = self.endpoint.decrement();
        report_active(&self.metrics, &self.endpoint, remaining);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

fn report_active(metrics: &SharedSink, endpoint: &ModuleEndpoint, active: usize) {
    metrics.set_gauge(
        m::ACTIVE_CONNECTIONS,
        &[
            ("protocol", endpoint.protocol.to_string()),
            ("module", endpoint.name.clone()),
        ],
        active as f64,
    );
}

/// `protocol` label for errors raised before detection succeeded.
const UNDETECTED_LABEL: &str = "unknown";

type ModuleTable = HashMap<Protocol, Vec<Arc<ModuleEndpoint>>>;

/// Protocol-sharded endpoint registry with least-connections routing.
pub struct Router {
    inspector: ProtocolInspector,
    modules: RwLock<ModuleTable>,
    selector: LeastConnections,
    limits: RegistryLimits,
    metrics: SharedSink,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("limits", &self.limits)
            .field("stats", &self.get_stats())
            .finish()
    }
}

impl Router {
    pub fn new(limits: RegistryLimits, metrics: SharedSink) -> Self {
        Self {
            inspector: ProtocolInspector::new(),
            modules: RwLock::new(HashMap::new()),
            selector: LeastConnections::new(),
            limits,
            metrics,
        }
    }

    pub fn inspector(&self) -> &ProtocolInspector {
        &self.inspector
    }

    /// Register a module under its protocol.
    ///
    /// `max_conns` of 0 or above the per-module cap is clamped to the cap.
    pub fn register_module(&self, spec: ModuleSpec) -> Result<EndpointSnapshot, RegistryError> {
        if !spec.protocol.is_known() {
            return Err(RegistryError::UnknownProtocol);
        }
        if spec.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let cap = self.limits.max_connections_per_module;
        let max_conns = match spec.max_conns {
            0 => cap,
            n if n > cap => {
                tracing::warn!(module = %spec.name, requested = n, cap, "Clamping module max_conns to cap");
                cap
            }
            n => n,
        };

        let mut table = self.modules.write().expect("module table lock poisoned");
        let bucket = table.entry(spec.protocol).or_default();

        if bucket.iter().any(|ep| ep.name == spec.name) {
            return Err(RegistryError::DuplicateModule {
                protocol: spec.protocol,
                name: spec.name,
            });
        }
        if bucket.len() >= self.limits.max_modules_per_protocol {
            return Err(RegistryError::TooManyModules {
                protocol: spec.protocol,
                limit: self.limits.max_modules_per_protocol,
            });
        }

        let endpoint = Arc::new(ModuleEndpoint::new(spec, max_conns));
        let snapshot = endpoint.snapshot();
        bucket.push(endpoint);
        drop(table);

        tracing::info!(
            module = %snapshot.name,
            protocol = %snapshot.protocol,
            target = %snapshot.target(),
            version = %snapshot.version,
            max_conns = snapshot.max_conns,
            id = %snapshot.id,
            "Registered module"
        );
        self.metrics.set_gauge(
            m::ACTIVE_CONNECTIONS,
            &[
                ("protocol", snapshot.protocol.to_string()),
                ("module", snapshot.name.clone()),
            ],
            0.0,
        );
        Ok(snapshot)
    }

    pub fn unregister_module(
        &self,
        protocol: Protocol,
        name: &str,
    ) -> Result<EndpointSnapshot, RegistryError> {
        let mut table = self.modules.write().expect("module table lock poisoned");
        let not_found = || RegistryError::ModuleNotFound {
            protocol,
            name: name.to_string(),
        };

        let bucket = table.get_mut(&protocol).ok_or_else(not_found)?;
        let idx = bucket
            .iter()
            .position(|ep| ep.name == name)
            .ok_or_else(not_found)?;
        let removed = bucket.remove(idx);
        if bucket.is_empty() {
            table.remove(&protocol);
        }
        drop(table);

        tracing::info!(module = %name, protocol = %protocol, "Unregistered module");
        Ok(removed.snapshot())
    }

    /// Inspect the first bytes of a connection and route it.
    pub fn route_connection(&self, data: &[u8]) -> Result<ConnectionGuard, RouteError> {
        let protocol = self.detect(data)?;
        self.route_protocol(protocol)
    }

    /// Run the inspector, counting a detection failure as a routing error.
    pub fn detect(&self, data: &[u8]) -> Result<Protocol, RouteError> {
        self.inspector.inspect(data).map_err(|e| {
            tracing::debug!(bytes = data.len(), "Protocol detection needs more data");
            let err = RouteError::from(e);
            self.record_error(Protocol::Unknown, &err);
            err
        })
    }

    /// Route a connection whose protocol is already known.
    pub fn route_protocol(&self, protocol: Protocol) -> Result<ConnectionGuard, RouteError> {
        self.route_preferring(protocol, None)
    }

    /// Route, restricting to modules of `version` when any healthy module
    /// carries it. Falls back to the whole healthy pool otherwise.
    pub fn route_preferring(
        &self,
        protocol: Protocol,
        version: Option<&str>,
    ) -> Result<ConnectionGuard, RouteError> {
        let result = self.select(protocol, version);
        match &result {
            Ok(guard) => {
                let ep = guard.endpoint();
                tracing::debug!(
                    protocol = %protocol,
                    module = %ep.name,
                    active = ep.active_conns,
                    "Routed connection"
                );
                self.metrics.increment_counter(
                    m::ROUTED_CONNECTIONS,
                    &[("protocol", protocol.to_string()), ("module", ep.name.clone())],
                );
                self.metrics.set_gauge(
                    m::ACTIVE_CONNECTIONS,
                    &[("protocol", protocol.to_string()), ("module", ep.name.clone())],
                    ep.active_conns as f64,
                );
            }
            Err(e) => self.record_error(protocol, e),
        }
        result
    }

    fn select(&self, protocol: Protocol, version: Option<&str>) -> Result<ConnectionGuard, RouteError> {
        if !protocol.is_known() {
            return Err(RouteError::ProtocolUnknown);
        }

        let table = self.modules.read().expect("module table lock poisoned");
        let bucket = match table.get(&protocol) {
            Some(b) if !b.is_empty() => b,
            _ => return Err(RouteError::NoModulesRegistered(protocol)),
        };

        let healthy: Vec<Arc<ModuleEndpoint>> =
            bucket.iter().filter(|ep| ep.is_healthy()).cloned().collect();
        drop(table);

        if healthy.is_empty() {
            return Err(RouteError::NoHealthyModules(protocol));
        }

        let pool = match version {
            Some(v) => {
                let matching: Vec<_> = healthy.iter().filter(|ep| ep.version == v).cloned().collect();
                if matching.is_empty() {
                    healthy
                } else {
                    matching
                }
            }
            None => healthy,
        };

        // The least-loaded module wins even when it is full; a full winner
        // means the connection is refused, not sent elsewhere.
        let endpoint = self
            .selector
            .next_server(&pool)
            .ok_or(RouteError::CapacityExceeded(protocol))?;

        if !endpoint.try_increment() {
            return Err(RouteError::CapacityExceeded(protocol));
        }

        Ok(ConnectionGuard {
            snapshot: endpoint.snapshot(),
            endpoint,
            metrics: self.metrics.clone(),
            armed: true,
        })
    }

    fn record_error(&self, protocol: Protocol, err: &RouteError) {
        tracing::debug!(protocol = %protocol, error = %err, "Routing failed");
        // Failures before a protocol is known carry a lowercase label.
        let label = if protocol.is_known() {
            protocol.to_string()
        } else {
            UNDETECTED_LABEL.to_string()
        };
        self.metrics.increment_counter(
            m::ROUTING_ERRORS,
            &[
                ("protocol", label),
                ("error_type", err.metric_label().to_string()),
            ],
        );
    }

    fn find(&self, protocol: Protocol, name: &str) -> Result<Arc<ModuleEndpoint>, RegistryError> {
        let table = self.modules.read().expect("module table lock poisoned");
        table
            .get(&protocol)
            .and_then(|bucket| bucket.iter().find(|ep| ep.name == name))
            .cloned()
            .ok_or_else(|| RegistryError::ModuleNotFound {
                protocol,
                name: name.to_string(),
            })
    }

    /// Report that a connection routed to `name` has closed.
    pub fn decrement_conns(&self, protocol: Protocol, name: &str) -> Result<usize, RegistryError> {
        let endpoint = self.find(protocol, name)?;
        let remaining = endpoint.decrement();
        report_active(&self.metrics, &endpoint, remaining);
        Ok(remaining)
    }

    pub fn set_health(&self, protocol: Protocol, name: &str, healthy: bool) -> Result<(), RegistryError> {
        let endpoint = self.find(protocol, name)?;
        let was = endpoint.is_healthy();
        endpoint.set_healthy(healthy);
        if was != healthy {
            tracing::info!(module = %name, protocol = %protocol, healthy, "Module health changed");
        }
        Ok(())
    }

    /// Update health for a module located by name alone.
    ///
    /// Returns the protocol the module was found under.
    pub fn set_health_by_name(&self, name: &str, healthy: bool) -> Result<Protocol, RegistryError> {
        let protocol = {
            let table = self.modules.read().expect("module table lock poisoned");
            table
                .iter()
                .find(|(_, bucket)| bucket.iter().any(|ep| ep.name == name))
                .map(|(p, _)| *p)
        };
        let protocol = protocol.ok_or_else(|| RegistryError::ModuleNameNotFound(name.to_string()))?;
        self.set_health(protocol, name, healthy)?;
        Ok(protocol)
    }

    pub fn get_modules(&self, protocol: Protocol) -> Vec<EndpointSnapshot> {
        let table = self.modules.read().expect("module table lock poisoned");
        table
            .get(&protocol)
            .map(|bucket| bucket.iter().map(|ep| ep.snapshot()).collect())
            .unwrap_or_default()
    }

    /// Every module, ordered by protocol then registration order.
    pub fn get_all_modules(&self) -> Vec<EndpointSnapshot> {
        let table = self.modules.read().expect("module table lock poisoned");
        let mut protocols: Vec<&Protocol> = table.keys().collect();
        protocols.sort();
        protocols
            .into_iter()
            .flat_map(|p| table[p].iter().map(|ep| ep.snapshot()))
            .collect()
    }

    pub fn module_count(&self, protocol: Protocol) -> usize {
        let table = self.modules.read().expect("module table lock poisoned");
        table.get(&protocol).map_or(0, Vec::len)
    }

    pub fn get_stats(&self) -> RouterStats {
        let table = self.modules.read().expect("module table lock poisoned");
        let mut stats = RouterStats::default();

        for (protocol, bucket) in table.iter() {
            let entry = stats.protocols.entry(*protocol).or_default();
            for ep in bucket {
                let active = ep.active_conns();
                entry.modules += 1;
                entry.active_connections += active;
                entry.capacity += ep.max_conns;
                if ep.is_healthy() {
                    entry.healthy_modules += 1;
                }
            }
            stats.total_modules += entry.modules;
            stats.healthy_modules += entry.healthy_modules;
            stats.total_connections += entry.active_connections;
        }
        stats
    }
}
