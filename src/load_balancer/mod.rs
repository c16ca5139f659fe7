//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! First bytes of a connection
//!     → inspector (detect protocol)
//!     → registry.rs (healthy modules for that protocol)
//!     → least_conn.rs (fewest active connections, ties rotate)
//!     → endpoint.rs (claim a slot, capped at max_conns)
//!     → ConnectionGuard back to the caller
//!
//! Connection closed → guard dropped / Router::decrement_conns
//! ```
//!
//! # Design Decisions
//! - One registry lock, sharded by protocol; routing takes it shared
//! - Per-endpoint counters are atomics, so routing never writes the table
//! - Unhealthy and full modules are excluded from selection
//! - Reads return value snapshots, never references into the table

pub mod endpoint;
pub mod least_conn;
pub mod registry;

use std::sync::Arc;

use endpoint::ModuleEndpoint;

pub use endpoint::{EndpointSnapshot, ModuleSpec};
pub use registry::{
    ConnectionGuard, ProtocolStats, RegistryError, RegistryLimits, RouteError, Router, RouterStats,
};

/// Selection strategy over a candidate set.
pub trait LoadBalancer: Send + Sync {
    fn next_server(&self, candidates: &[Arc<ModuleEndpoint>]) -> Option<Arc<ModuleEndpoint>>;
}
