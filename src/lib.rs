//! Protocol-aware network load balancer library.

// Traffic path
pub mod inspector;
pub mod load_balancer;
pub mod nlb;

// Control
pub mod autoscale;
pub mod deploy;
pub mod rpc;

// Cross-cutting concerns
pub mod admin;
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::NlbConfig;
pub use inspector::{Protocol, ProtocolInspector};
pub use lifecycle::Shutdown;
pub use nlb::{Nlb, NlbError};
