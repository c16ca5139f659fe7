//! The assembled balancer.
//!
//! # Responsibilities
//! - Build every component from one validated `NlbConfig`
//! - Route a connection: inspect, rate-limit, pick a deployment color, select
//! - Start and stop the supervised background loops
//! - Apply hot-reloaded bucket and policy settings

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

use crate::autoscale::{AutoscaleError, Autoscaler, AutoscalerStats};
use crate::config::NlbConfig;
use crate::deploy::{BlueGreenController, DeployError, DeployStats};
use crate::inspector::{parse_protocol, Protocol};
use crate::lifecycle::supervisor::{self, StopOutcome};
use crate::load_balancer::{ConnectionGuard, RegistryError, RouteError, Router, RouterStats};
use crate::observability::metrics::SharedSink;
use crate::rpc::{ClientError, ClientPool, ClientStatus, ControlPlane};
use crate::security::{BucketStats, RateLimiter};

#[derive(Debug, Error)]
pub enum NlbError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("rate limit exceeded for {protocol} (bucket {bucket})")]
    RateLimited { protocol: Protocol, bucket: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Autoscale(#[from] AutoscaleError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl NlbError {
    /// Whether the caller should buffer more bytes and route again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NlbError::Route(e) if e.is_retryable())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Features {
    pub rate_limit: bool,
    pub autoscale: bool,
    pub blue_green: bool,
    pub admin: bool,
    pub metrics: bool,
}

/// Everything `/status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct NlbStatus {
    pub version: &'static str,
    pub features: Features,
    pub router: RouterStats,
    pub rate_limits: Vec<BucketStats>,
    pub autoscaler: AutoscalerStats,
    pub deployments: DeployStats,
    pub clients: Vec<ClientStatus>,
}

pub struct Nlb {
    config: ArcSwap<NlbConfig>,
    router: Arc<Router>,
    limiter: Arc<RateLimiter>,
    autoscaler: Arc<Autoscaler>,
    deployments: Arc<BlueGreenController>,
    clients: Arc<ClientPool>,
    control: ControlPlane,
}

impl std::fmt::Debug for Nlb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nlb")
            .field("router", &self.router)
            .field("limiter", &self.limiter)
            .field("autoscaler", &self.autoscaler)
            .field("deployments", &self.deployments)
            .finish()
    }
}

impl Nlb {
    /// Build the balancer. `config` is expected to be validated.
    pub fn new(config: NlbConfig, metrics: SharedSink) -> Result<Self, NlbError> {
        let router = Arc::new(Router::new(config.modules.limits(), metrics.clone()));
        let limiter = Arc::new(RateLimiter::new(metrics.clone()));
        let autoscaler = Arc::new(Autoscaler::new(
            router.clone(),
            config.autoscale.settings(),
            metrics.clone(),
        ));
        let deployments = Arc::new(BlueGreenController::new(
            config.blue_green.settings(),
            metrics.clone(),
        ));
        let clients = Arc::new(ClientPool::new(config.modules.client_settings()));
        let control = ControlPlane::new(router.clone(), autoscaler.clone(), clients.clone());

        let nlb = Self {
            config: ArcSwap::from_pointee(NlbConfig::default()),
            router,
            limiter,
            autoscaler,
            deployments,
            clients,
            control,
        };
        nlb.apply_config(config)?;
        Ok(nlb)
    }

    pub fn config(&self) -> Arc<NlbConfig> {
        self.config.load_full()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn autoscaler(&self) -> &Arc<Autoscaler> {
        &self.autoscaler
    }

    pub fn deployments(&self) -> &Arc<BlueGreenController> {
        &self.deployments
    }

    pub fn clients(&self) -> &Arc<ClientPool> {
        &self.clients
    }

    pub fn control_plane(&self) -> &ControlPlane {
        &self.control
    }

    /// Route a new connection from its first bytes.
    pub fn route(&self, data: &[u8]) -> Result<ConnectionGuard, NlbError> {
        self.route_with_roll(data, fastrand::u32(0..100))
    }

    /// [`route`](Self::route) with the blue/green roll supplied, 0..100.
    pub fn route_with_roll(&self, data: &[u8], roll: u32) -> Result<ConnectionGuard, NlbError> {
        let config = self.config.load();
        let protocol = self.router.detect(data)?;

        if protocol.is_known() && config.rate_limit.enabled {
            let bucket = protocol.bucket_key();
            if !self.limiter.allow(&bucket) {
                return Err(NlbError::RateLimited { protocol, bucket });
            }
        }

        let version = if config.blue_green.enabled {
            self.deployments.preferred_version(protocol, roll)
        } else {
            None
        };

        Ok(self.router.route_preferring(protocol, version.as_deref())?)
    }

    /// Spawn the autoscaler loop (when enabled) and the client health loop.
    pub fn start(&self) -> Result<(), NlbError> {
        if self.config.load().autoscale.enabled {
            self.autoscaler.start()?;
        }
        self.clients.start();
        tracing::info!("Balancer background tasks started");
        Ok(())
    }

    /// Join every background task within `timeout`, then close all clients.
    pub async fn stop(&self, timeout: Duration) -> Vec<(String, StopOutcome)> {
        let mut tasks = Vec::new();
        tasks.extend(self.autoscaler.take_task());
        tasks.extend(self.clients.take_task());
        tasks.extend(self.deployments.take_steppers());

        let outcomes = supervisor::stop_all(tasks, timeout).await;
        self.clients.close_all();

        let aborted = outcomes
            .iter()
            .filter(|(_, o)| *o != StopOutcome::Joined)
            .count();
        tracing::info!(tasks = outcomes.len(), aborted, "Balancer stopped");
        outcomes
    }

    /// Sync configured buckets and re-set every policy.
    ///
    /// A bucket is only rebuilt when its settings changed, so a reload keeps
    /// drained balances. Buckets and policies that disappeared from the file
    /// are left alone.
    pub fn apply_config(&self, config: NlbConfig) -> Result<(), NlbError> {
        if config.rate_limit.enabled {
            for bucket in config.rate_limit.effective_buckets() {
                self.limiter.ensure_bucket(
                    &bucket.name,
                    parse_protocol(&bucket.protocol),
                    bucket.capacity,
                    bucket.refill_rate,
                );
            }
        }

        if config.autoscale.enabled {
            for policy in config.autoscale.effective_policies() {
                self.autoscaler.set_policy(policy)?;
            }
        }

        tracing::info!(
            buckets = self.limiter.bucket_names().len(),
            rate_limit = config.rate_limit.enabled,
            autoscale = config.autoscale.enabled,
            "Configuration applied"
        );
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub fn status(&self) -> NlbStatus {
        let config = self.config.load();
        NlbStatus {
            version: env!("CARGO_PKG_VERSION"),
            features: Features {
                rate_limit: config.rate_limit.enabled,
                autoscale: config.autoscale.enabled,
                blue_green: config.blue_green.enabled,
                admin: config.admin.enabled,
                metrics: config.observability.metrics_enabled,
            },
            router: self.router.get_stats(),
            rate_limits: self.limiter.all_stats(),
            autoscaler: self.autoscaler.stats(),
            deployments: self.deployments.stats(),
            clients: self.clients.statuses(),
        }
    }
}
