//! Module endpoint abstraction.
//!
//! # Responsibilities
//! - Represent a single registered backend module instance
//! - Track active connections for least-connections selection
//! - Enforce the per-module connection cap
//! - Track health and the last time the module was seen healthy

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inspector::Protocol;

/// Registration request for a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 0 means "use the registry's per-module cap".
    #[serde(default)]
    pub max_conns: usize,
}

fn default_weight() -> u32 {
    1
}

/// A registered backend module.
#[derive(Debug)]
pub struct ModuleEndpoint {
    pub id: Uuid,
    pub name: String,
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    pub version: String,
    pub weight: u32,
    pub max_conns: usize,
    active_conns: AtomicUsize,
    healthy: AtomicBool,
    /// Milliseconds since the Unix epoch.
    last_healthy: AtomicU64,
}

/// Point-in-time copy of an endpoint. Never aliases live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub id: Uuid,
    pub name: String,
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    pub version: String,
    pub weight: u32,
    pub max_conns: usize,
    pub active_conns: usize,
    pub healthy: bool,
    pub last_healthy_ms: u64,
}

impl EndpointSnapshot {
    /// `address:port` form for dialing.
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ModuleEndpoint {
    /// Create a healthy endpoint with zero connections.
    pub fn new(spec: ModuleSpec, max_conns: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            protocol: spec.protocol,
            address: spec.address,
            port: spec.port,
            version: spec.version,
            weight: spec.weight,
            max_conns,
            active_conns: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            last_healthy: AtomicU64::new(now_millis()),
        }
    }

    pub fn active_conns(&self) -> usize {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_conns() < self.max_conns
    }

    /// Claim a connection slot. Fails exactly when the count is at `max_conns`.
    pub fn try_increment(&self) -> bool {
        let mut prev = self.active_conns.load(Ordering::Acquire);
        loop {
            if prev >= self.max_conns {
                return false;
            }
            match self.active_conns.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(x) => prev = x,
            }
        }
    }

    /// Release a connection slot. Floors at zero.
    pub fn decrement(&self) -> usize {
        let prev = self
            .active_conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Update health; a healthy report also refreshes `last_healthy`.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        if healthy {
            self.last_healthy.store(now_millis(), Ordering::Release);
        }
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.id,
            name: self.name.clone(),
            protocol: self.protocol,
            address: self.address.clone(),
            port: self.port,
            version: self.version.clone(),
            weight: self.weight,
            max_conns: self.max_conns,
            active_conns: self.active_conns(),
            healthy: self.is_healthy(),
            last_healthy_ms: self.last_healthy.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
pub(crate) fn spec(name: &str, protocol: Protocol, max_conns: usize) -> ModuleSpec {
    ModuleSpec {
        name: name.to_string(),
        protocol,
        address: "127.0.0.1".to_string(),
        port: 9000,
        version: "v1".to_string(),
        weight: 1,
        max_conns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_stops_at_cap() {
        let ep = ModuleEndpoint::new(spec("http-1", Protocol::Http, 2), 2);
        assert!(ep.try_increment());
        assert!(ep.try_increment());
        assert!(!ep.try_increment());
        assert_eq!(ep.active_conns(), 2);
        assert!(!ep.has_capacity());
    }

    #[test]
    fn test_decrement_floors_at_zero() {
        let ep = ModuleEndpoint::new(spec("http-1", Protocol::Http, 5), 5);
        for _ in 0..5 {
            assert!(ep.try_increment());
        }
        for _ in 0..5 {
            ep.decrement();
        }
        assert_eq!(ep.active_conns(), 0);
        assert_eq!(ep.decrement(), 0);
        assert_eq!(ep.active_conns(), 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let ep = ModuleEndpoint::new(spec("redis-1", Protocol::Redis, 3), 3);
        let before = ep.snapshot();
        ep.try_increment();
        ep.set_healthy(false);

        assert_eq!(before.active_conns, 0);
        assert!(before.healthy);
        assert_eq!(ep.snapshot().active_conns, 1);
        assert!(!ep.snapshot().healthy);
        assert_eq!(before.target(), "127.0.0.1:9000");
    }

    #[test]
    fn test_concurrent_increments_respect_cap() {
        use std::sync::Arc;

        let ep = Arc::new(ModuleEndpoint::new(spec("pg-1", Protocol::PostgreSql, 50), 50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ep = ep.clone();
                std::thread::spawn(move || (0..20).filter(|_| ep.try_increment()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(granted, 50);
        assert_eq!(ep.active_conns(), 50);
    }
}
