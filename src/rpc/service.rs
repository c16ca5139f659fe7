//! Control-plane service: module registration, health, stats and metric reports.
//!
//! Errors are reported in-band (`success: false` plus a message), the way a
//! module's registration client expects them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::autoscale::Autoscaler;
use crate::inspector::{parse_protocol, Protocol};
use crate::load_balancer::{ModuleSpec, Router};
use crate::rpc::client::{ClientError, ClientPool, ClientState};
use crate::rpc::types::{
    Ack, HealthUpdateRequest, RegisterModuleRequest, RegisterModuleResponse, ReportMetricsRequest,
    StatsRequest, StatsResponse, UnregisterModuleRequest,
};

pub struct ControlPlane {
    router: Arc<Router>,
    autoscaler: Arc<Autoscaler>,
    clients: Arc<ClientPool>,
}

impl fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlane")
            .field("router", &self.router)
            .field("clients", &self.clients)
            .finish()
    }
}

fn known_protocol(raw: &str) -> Result<Protocol, String> {
    match parse_protocol(raw) {
        Protocol::Unknown => Err(format!("unknown protocol: {raw}")),
        p => Ok(p),
    }
}

impl ControlPlane {
    pub fn new(router: Arc<Router>, autoscaler: Arc<Autoscaler>, clients: Arc<ClientPool>) -> Self {
        Self {
            router,
            autoscaler,
            clients,
        }
    }

    /// Register a module with the router and open a client to it.
    ///
    /// An unreachable module is still registered; the client pool keeps
    /// retrying in the background.
    pub async fn register_module(&self, req: RegisterModuleRequest) -> RegisterModuleResponse {
        let failed = |message: String| RegisterModuleResponse {
            success: false,
            message,
            module_id: None,
        };

        let protocol = match known_protocol(&req.protocol) {
            Ok(p) => p,
            Err(msg) => return failed(msg),
        };
        if req.port == 0 {
            return failed("port must be non-zero".to_string());
        }

        let spec = ModuleSpec {
            name: req.module_name.clone(),
            protocol,
            address: req.address.clone(),
            port: req.port,
            version: req.version,
            weight: 1,
            max_conns: req.max_conns as usize,
        };
        let snapshot = match self.router.register_module(spec) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(module = %req.module_name, protocol = %protocol, error = %e, "Module registration rejected");
                return failed(e.to_string());
            }
        };

        match self
            .clients
            .add_client(&req.module_name, protocol, &req.address, req.port)
            .await
        {
            Ok(_) => {}
            // Left over from an earlier registration; keep it.
            Err(ClientError::AlreadyExists(_)) => {}
            Err(e) => {
                tracing::warn!(module = %req.module_name, error = %e, "Could not create module client");
            }
        }

        RegisterModuleResponse {
            success: true,
            message: format!("module {} registered for {}", snapshot.name, protocol),
            module_id: Some(snapshot.id.to_string()),
        }
    }

    pub async fn unregister_module(&self, req: UnregisterModuleRequest) -> Ack {
        let protocol = match known_protocol(&req.protocol) {
            Ok(p) => p,
            Err(msg) => return Ack::failed(msg),
        };

        if let Err(e) = self.router.unregister_module(protocol, &req.module_name) {
            return Ack::failed(e.to_string());
        }
        if let Err(e) = self.clients.remove_client(protocol, &req.module_name) {
            tracing::debug!(module = %req.module_name, error = %e, "No client to remove");
        }
        Ack::ok(format!("module {} unregistered", req.module_name))
    }

    /// Health reports identify a module by name alone.
    pub async fn update_health(&self, req: HealthUpdateRequest) -> Ack {
        match self.router.set_health_by_name(&req.module_name, req.healthy) {
            Ok(protocol) => {
                tracing::debug!(
                    module = %req.module_name,
                    protocol = %protocol,
                    healthy = req.healthy,
                    reported_at = req.timestamp,
                    "Health update applied"
                );
                Ack::ok("health updated")
            }
            Err(e) => Ack::failed(e.to_string()),
        }
    }

    pub async fn report_metrics(&self, req: ReportMetricsRequest) -> Ack {
        let protocol = match known_protocol(&req.protocol) {
            Ok(p) => p,
            Err(msg) => return Ack::failed(msg),
        };
        self.autoscaler.record_metrics(protocol, req.metrics);
        Ack::ok("metrics recorded")
    }

    pub async fn get_stats(&self, req: StatsRequest) -> StatsResponse {
        let router_stats = self.router.get_stats();
        let mut stats = BTreeMap::new();

        for (protocol, p) in &router_stats.protocols {
            let key = protocol.bucket_key();
            stats.insert(format!("{key}.modules"), p.modules.to_string());
            stats.insert(format!("{key}.healthy"), p.healthy_modules.to_string());
            stats.insert(format!("{key}.connections"), p.active_connections.to_string());
            stats.insert(format!("{key}.capacity"), p.capacity.to_string());
        }

        if req.include_metrics {
            for protocol in Protocol::ALL {
                let samples = self.autoscaler.sample_count(protocol);
                if samples > 0 {
                    stats.insert(format!("{}.samples", protocol.bucket_key()), samples.to_string());
                }
            }
            let ready = self
                .clients
                .statuses()
                .iter()
                .filter(|c| c.state == ClientState::Ready)
                .count();
            stats.insert("clients.total".to_string(), self.clients.len().to_string());
            stats.insert("clients.ready".to_string(), ready.to_string());
            stats.insert(
                "autoscaler.running".to_string(),
                self.autoscaler.is_running().to_string(),
            );
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        StatsResponse {
            timestamp,
            total_modules: router_stats.total_modules,
            healthy_modules: router_stats.healthy_modules,
            total_conns: router_stats.total_connections,
            stats,
            modules: req.include_modules.then(|| self.router.get_all_modules()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscale::AutoscalerSettings;
    use crate::load_balancer::RegistryLimits;
    use crate::observability::metrics::NoopSink;
    use crate::rpc::client::ClientSettings;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn plane() -> ControlPlane {
        let router = Arc::new(Router::new(RegistryLimits::default(), Arc::new(NoopSink)));
        let autoscaler = Arc::new(Autoscaler::new(
            router.clone(),
            AutoscalerSettings::default(),
            Arc::new(NoopSink),
        ));
        let clients = Arc::new(ClientPool::new(ClientSettings {
            connect_timeout: Duration::from_millis(200),
            ..ClientSettings::default()
        }));
        ControlPlane::new(router, autoscaler, clients)
    }

    fn register(name: &str, protocol: &str, port: u16) -> RegisterModuleRequest {
        RegisterModuleRequest {
            module_name: name.to_string(),
            protocol: protocol.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            version: "v1".to_string(),
            max_conns: 0,
        }
    }

    #[tokio::test]
    async fn test_register_unregister_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let plane = plane();

        let resp = plane.register_module(register("http-1", "http", port)).await;
        assert!(resp.success, "{}", resp.message);
        assert!(resp.module_id.is_some());
        assert_eq!(plane.clients.len(), 1);

        let dup = plane.register_module(register("http-1", "HTTP", port)).await;
        assert!(!dup.success);
        assert!(dup.message.contains("already registered"));

        let gone = plane
            .unregister_module(UnregisterModuleRequest {
                module_name: "http-1".into(),
                protocol: "http".into(),
            })
            .await;
        assert!(gone.success);
        assert!(plane.clients.is_empty());
        assert_eq!(plane.router.module_count(Protocol::Http), 0);
    }

    #[tokio::test]
    async fn test_unknown_protocol_rejected() {
        let plane = plane();
        let resp = plane.register_module(register("x", "gopher", 7000)).await;
        assert!(!resp.success);
        assert!(resp.message.contains("unknown protocol"));

        let ack = plane
            .report_metrics(ReportMetricsRequest {
                protocol: "gopher".into(),
                metrics: Default::default(),
            })
            .await;
        assert!(!ack.success);
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let plane = plane();

        plane.register_module(register("redis-1", "redis", port)).await;
        plane.register_module(register("redis-2", "redis", port)).await;

        let ack = plane
            .update_health(HealthUpdateRequest {
                module_name: "redis-2".into(),
                healthy: false,
                timestamp: 0,
            })
            .await;
        assert!(ack.success);

        let missing = plane
            .update_health(HealthUpdateRequest {
                module_name: "ghost".into(),
                healthy: true,
                timestamp: 0,
            })
            .await;
        assert!(!missing.success);

        plane
            .report_metrics(ReportMetricsRequest {
                protocol: "redis".into(),
                metrics: Default::default(),
            })
            .await;

        let stats = plane
            .get_stats(StatsRequest {
                include_modules: true,
                include_metrics: true,
            })
            .await;
        assert_eq!(stats.total_modules, 2);
        assert_eq!(stats.healthy_modules, 1);
        assert_eq!(stats.stats["redis.modules"], "2");
        assert_eq!(stats.stats["redis.healthy"], "1");
        assert_eq!(stats.stats["redis.samples"], "1");
        assert_eq!(stats.stats["clients.total"], "2");
        assert_eq!(stats.modules.as_ref().map(Vec::len), Some(2));

        let bare = plane.get_stats(StatsRequest::default()).await;
        assert!(bare.modules.is_none());
        assert!(!bare.stats.contains_key("clients.total"));
    }
}
