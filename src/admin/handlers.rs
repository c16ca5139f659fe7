use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::autoscale::ScalingMetrics;
use crate::deploy::{DeployError, DeploymentColor, DeploymentState};
use crate::inspector::{parse_protocol, Protocol};
use crate::nlb::NlbStatus;
use crate::rpc::{
    Ack, HealthUpdateRequest, RegisterModuleRequest, RegisterModuleResponse, ReportMetricsRequest,
    StatsRequest, StatsResponse, UnregisterModuleRequest,
};

/// JSON error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: &self.1 })).into_response()
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        let status = match e {
            DeployError::NotInitialized(_) => StatusCode::NOT_FOUND,
            DeployError::RolloutInProgress(_) => StatusCode::CONFLICT,
            DeployError::InvalidProtocol | DeployError::InvalidStep(_) => StatusCode::BAD_REQUEST,
            DeployError::WeightInvariant { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

fn protocol_param(raw: &str) -> Result<Protocol, ApiError> {
    match parse_protocol(raw) {
        Protocol::Unknown => Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("unknown protocol: {raw}"),
        )),
        p => Ok(p),
    }
}

fn ack_status(success: bool) -> StatusCode {
    if success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn get_status(State(state): State<AdminState>) -> Json<NlbStatus> {
    Json(state.nlb.status())
}

pub async fn get_metrics(State(state): State<AdminState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ApiError(StatusCode::NOT_FOUND, "metrics are disabled".into()).into_response(),
    }
}

pub async fn register_module(
    State(state): State<AdminState>,
    Json(req): Json<RegisterModuleRequest>,
) -> (StatusCode, Json<RegisterModuleResponse>) {
    let resp = state.nlb.control_plane().register_module(req).await;
    (ack_status(resp.success), Json(resp))
}

pub async fn unregister_module(
    State(state): State<AdminState>,
    Path((protocol, name)): Path<(String, String)>,
) -> (StatusCode, Json<Ack>) {
    let resp = state
        .nlb
        .control_plane()
        .unregister_module(UnregisterModuleRequest {
            module_name: name,
            protocol,
        })
        .await;
    let status = if resp.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(resp))
}

#[derive(Debug, Deserialize)]
pub struct HealthBody {
    pub healthy: bool,
    #[serde(default)]
    pub timestamp: i64,
}

pub async fn update_health(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<HealthBody>,
) -> (StatusCode, Json<Ack>) {
    let resp = state
        .nlb
        .control_plane()
        .update_health(HealthUpdateRequest {
            module_name: name,
            healthy: body.healthy,
            timestamp: body.timestamp,
        })
        .await;
    let status = if resp.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(resp))
}

pub async fn get_stats(
    State(state): State<AdminState>,
    Query(req): Query<StatsRequest>,
) -> Json<StatsResponse> {
    Json(state.nlb.control_plane().get_stats(req).await)
}

pub async fn report_metrics(
    State(state): State<AdminState>,
    Path(protocol): Path<String>,
    Json(metrics): Json<ScalingMetrics>,
) -> (StatusCode, Json<Ack>) {
    let resp = state
        .nlb
        .control_plane()
        .report_metrics(ReportMetricsRequest { protocol, metrics })
        .await;
    (ack_status(resp.success), Json(resp))
}

pub async fn get_deployment(
    State(state): State<AdminState>,
    Path(protocol): Path<String>,
) -> Result<Json<DeploymentState>, ApiError> {
    let protocol = protocol_param(&protocol)?;
    state
        .nlb
        .deployments()
        .get_deployment_state(protocol)
        .map(Json)
        .ok_or_else(|| DeployError::NotInitialized(protocol).into())
}

#[derive(Debug, Deserialize)]
pub struct InitBody {
    pub version: String,
    #[serde(default = "blue")]
    pub color: DeploymentColor,
}

fn blue() -> DeploymentColor {
    DeploymentColor::Blue
}

pub async fn init_deployment(
    State(state): State<AdminState>,
    Path(protocol): Path<String>,
    Json(body): Json<InitBody>,
) -> Result<Json<DeploymentState>, ApiError> {
    let protocol = protocol_param(&protocol)?;
    let deployment = state
        .nlb
        .deployments()
        .initialize_deployment(protocol, &body.version, body.color)?;
    Ok(Json(deployment))
}

#[derive(Debug, Deserialize)]
pub struct CanaryBody {
    pub version: String,
    pub target: DeploymentColor,
    pub step_size: Option<u32>,
    pub step_duration_secs: Option<u64>,
}

pub async fn start_canary(
    State(state): State<AdminState>,
    Path(protocol): Path<String>,
    Json(body): Json<CanaryBody>,
) -> Result<Json<DeploymentState>, ApiError> {
    let protocol = protocol_param(&protocol)?;
    let deployment = state.nlb.deployments().start_canary_deployment(
        protocol,
        &body.version,
        body.target,
        body.step_size,
        body.step_duration_secs.map(Duration::from_secs),
    )?;
    Ok(Json(deployment))
}

#[derive(Debug, Deserialize)]
pub struct SwitchBody {
    pub target: DeploymentColor,
}

pub async fn instant_switch(
    State(state): State<AdminState>,
    Path(protocol): Path<String>,
    Json(body): Json<SwitchBody>,
) -> Result<Json<DeploymentState>, ApiError> {
    let protocol = protocol_param(&protocol)?;
    Ok(Json(state.nlb.deployments().instant_switch(protocol, body.target)?))
}

pub async fn rollback(
    State(state): State<AdminState>,
    Path(protocol): Path<String>,
) -> Result<Json<DeploymentState>, ApiError> {
    let protocol = protocol_param(&protocol)?;
    Ok(Json(state.nlb.deployments().rollback(protocol)?))
}
