//! Admin and control-plane HTTP round trips.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use proxy_nlb::admin::{setup_admin_router, AdminState};
use proxy_nlb::config::NlbConfig;
use proxy_nlb::inspector::Protocol;

use common::{build_nlb, ModuleServer, HTTP_GET};

const KEY: &str = "test-admin-key";

fn app() -> (Router, std::sync::Arc<proxy_nlb::Nlb>) {
    let mut config = NlbConfig::default();
    config.admin.api_key = KEY.to_string();
    let (nlb, _) = build_nlb(config);
    let router = setup_admin_router(AdminState {
        nlb: nlb.clone(),
        prometheus: None,
    });
    (router, nlb)
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {KEY}"));
    match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_open_routes() {
    let (app, _) = app();

    let resp = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));

    let (status, body) = send(&app, Request::get("/status").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["features"]["blue_green"], true);
    assert_eq!(body["router"]["total_modules"], 0);
    assert_eq!(body["rate_limits"].as_array().map(Vec::len), Some(6));

    let (status, _) = send(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_control_routes_require_key() {
    let (app, _) = app();

    let no_key = Request::get("/v1/stats").body(Body::empty()).unwrap();
    let (status, _) = send(&app, no_key).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong_key = Request::get("/v1/stats")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, wrong_key).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, request(Method::GET, "/v1/stats", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_modules"], 0);
}

#[tokio::test]
async fn test_module_registration_lifecycle() {
    let (app, nlb) = app();
    let server = ModuleServer::start().await;

    let register = json!({
        "module_name": "http-1",
        "protocol": "http",
        "address": "127.0.0.1",
        "port": server.port,
        "version": "v1",
        "max_conns": 2,
    });
    let (status, body) = send(&app, request(Method::POST, "/v1/modules", Some(register.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["module_id"].is_string());

    let (status, body) = send(&app, request(Method::POST, "/v1/modules", Some(register))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    // Registered modules take traffic and have a ready client.
    assert_eq!(nlb.route(HTTP_GET).unwrap().endpoint().name, "http-1");
    assert!(nlb.clients().get_connection(Protocol::Http, "http-1").is_ok());

    let (status, _) = send(
        &app,
        request(Method::POST, "/v1/health/http-1", Some(json!({ "healthy": false }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(nlb.route(HTTP_GET).is_err());

    let (status, body) = send(
        &app,
        request(Method::GET, "/v1/stats?include_modules=true&include_metrics=true", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_modules"], 1);
    assert_eq!(body["healthy_modules"], 0);
    assert_eq!(body["stats"]["clients.ready"], "1");
    assert_eq!(body["modules"][0]["name"], "http-1");

    let (status, _) = send(&app, request(Method::DELETE, "/v1/modules/http/http-1", None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, request(Method::DELETE, "/v1/modules/http/http-1", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(nlb.clients().is_empty());

    server.stop();
}

#[tokio::test]
async fn test_metric_reports_feed_autoscaler() {
    let (app, nlb) = app();

    let sample = json!({ "cpu_utilization": 91.0, "connection_count": 40 });
    let (status, _) = send(&app, request(Method::POST, "/v1/metrics/redis", Some(sample.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nlb.autoscaler().sample_count(Protocol::Redis), 1);

    let (status, body) = send(&app, request(Method::POST, "/v1/metrics/gopher", Some(sample))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("unknown protocol"));
}

#[tokio::test]
async fn test_deployment_routes() {
    let (app, _) = app();

    let (status, _) = send(&app, request(Method::GET, "/v1/deployments/http", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        request(Method::POST, "/v1/deployments/http/init", Some(json!({ "version": "v1" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["blue_weight"], 100);
    assert_eq!(body["blue_version"], "v1");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/v1/deployments/http/switch",
            Some(json!({ "target": "green" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["green_weight"], 100);
    assert_eq!(body["active_color"], "green");

    let (status, body) = send(&app, request(Method::POST, "/v1/deployments/http/rollback", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_color"], "blue");
    assert_eq!(body["status"], "rollback");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/v1/deployments/http/canary",
            Some(json!({ "version": "v2", "target": "green", "step_size": 0 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("step"));

    let (status, _) = send(&app, request(Method::POST, "/v1/deployments/gopher/rollback", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
