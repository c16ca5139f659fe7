//! Module control plane.
//!
//! # Data Flow
//! ```text
//! Module process:
//!     RegisterModule   → Router::register_module → ClientPool::add_client
//!     HealthUpdate     → Router::set_health_by_name
//!     ReportMetrics    → Autoscaler::record_metrics
//!     UnregisterModule → Router::unregister_module → ClientPool::remove_client
//!
//! Client pool health loop (every health_check_interval):
//!     ready clients   → liveness probe
//!     failed clients  → redial once their backoff has elapsed
//! ```
//!
//! # Design Decisions
//! - Messages are plain serde structs; the admin API carries them as JSON
//! - Client errors never fail a registration

pub mod client;
pub mod service;
pub mod types;

pub use client::{ClientError, ClientPool, ClientSettings, ClientState, ClientStatus, ModuleClient};
pub use service::ControlPlane;
pub use types::{
    Ack, HealthUpdateRequest, RegisterModuleRequest, RegisterModuleResponse, ReportMetricsRequest,
    StatsRequest, StatsResponse, UnregisterModuleRequest,
};
