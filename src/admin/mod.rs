//! Admin and control-plane HTTP surface.
//!
//! Open routes: `/healthz`, `/status`, `/metrics`.
//! Everything under `/v1` requires the admin bearer token when one is set.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::nlb::Nlb;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state injected into admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub nlb: Arc<Nlb>,
    pub prometheus: Option<PrometheusHandle>,
}

#[allow(deprecated)]
pub fn setup_admin_router(state: AdminState) -> Router {
    let control = Router::new()
        .route("/v1/modules", post(register_module))
        .route("/v1/modules/{protocol}/{name}", delete(unregister_module))
        .route("/v1/health/{name}", post(update_health))
        .route("/v1/stats", get(get_stats))
        .route("/v1/metrics/{protocol}", post(report_metrics))
        .route("/v1/deployments/{protocol}", get(get_deployment))
        .route("/v1/deployments/{protocol}/init", post(init_deployment))
        .route("/v1/deployments/{protocol}/canary", post(start_canary))
        .route("/v1/deployments/{protocol}/switch", post(instant_switch))
        .route("/v1/deployments/{protocol}/rollback", post(rollback))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .merge(control)
        .with_state(state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
