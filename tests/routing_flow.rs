//! End-to-end routing through the assembled balancer.

mod common;

use proxy_nlb::config::NlbConfig;
use proxy_nlb::inspector::Protocol;
use proxy_nlb::load_balancer::RouteError;
use proxy_nlb::observability::metrics::{
    ACTIVE_CONNECTIONS, RATELIMIT_ALLOWED, RATELIMIT_DENIED, ROUTED_CONNECTIONS, ROUTING_ERRORS,
};
use proxy_nlb::NlbError;

use common::{build_nlb, module, HTTP_GET, PG_STARTUP, REDIS_PING};

#[tokio::test]
async fn test_least_connections_until_capacity() {
    let (nlb, sink) = build_nlb(NlbConfig::default());
    nlb.router().register_module(module("http-1", Protocol::Http, 2)).unwrap();
    nlb.router().register_module(module("http-2", Protocol::Http, 2)).unwrap();

    let first = nlb.route(HTTP_GET).unwrap();
    let second = nlb.route(HTTP_GET).unwrap();
    // The second pick goes to whichever module is still idle.
    assert_ne!(first.endpoint().name, second.endpoint().name);

    let third = nlb.route(HTTP_GET).unwrap();
    let fourth = nlb.route(HTTP_GET).unwrap();
    assert_ne!(third.endpoint().name, fourth.endpoint().name);

    match nlb.route(HTTP_GET) {
        Err(NlbError::Route(RouteError::CapacityExceeded(Protocol::Http))) => {}
        other => panic!("expected capacity exceeded, got {other:?}"),
    }

    for m in nlb.router().get_modules(Protocol::Http) {
        assert_eq!(m.active_conns, 2);
    }
    assert_eq!(sink.counter_total(ROUTED_CONNECTIONS), 4);
    assert_eq!(
        sink.counter(
            ROUTING_ERRORS,
            &[("protocol", "HTTP"), ("error_type", "max_connections")]
        ),
        1
    );

    // Closing one connection frees exactly one slot.
    let freed = first.endpoint().name.clone();
    drop(first);
    let again = nlb.route(HTTP_GET).unwrap();
    assert_eq!(again.endpoint().name, freed);

    drop((second, third, fourth, again));
    assert_eq!(nlb.router().get_stats().total_connections, 0);
    assert_eq!(
        sink.gauge(ACTIVE_CONNECTIONS, &[("protocol", "HTTP"), ("module", "http-1")]),
        Some(0.0)
    );
}

#[tokio::test]
async fn test_protocols_route_to_their_own_modules() {
    let (nlb, _) = build_nlb(NlbConfig::default());
    nlb.router().register_module(module("web", Protocol::Http, 0)).unwrap();
    nlb.router().register_module(module("cache", Protocol::Redis, 0)).unwrap();
    nlb.router().register_module(module("db", Protocol::PostgreSql, 0)).unwrap();

    assert_eq!(nlb.route(HTTP_GET).unwrap().endpoint().name, "web");
    assert_eq!(nlb.route(REDIS_PING).unwrap().endpoint().name, "cache");
    assert_eq!(nlb.route(PG_STARTUP).unwrap().endpoint().name, "db");
}

#[tokio::test]
async fn test_unhealthy_and_unregistered_modules() {
    let (nlb, sink) = build_nlb(NlbConfig::default());
    nlb.router().register_module(module("cache-1", Protocol::Redis, 0)).unwrap();
    nlb.router().register_module(module("cache-2", Protocol::Redis, 0)).unwrap();

    nlb.router().set_health(Protocol::Redis, "cache-1", false).unwrap();
    for _ in 0..3 {
        let guard = nlb.route(REDIS_PING).unwrap();
        assert_eq!(guard.endpoint().name, "cache-2");
    }

    nlb.router().set_health(Protocol::Redis, "cache-2", false).unwrap();
    assert!(matches!(
        nlb.route(REDIS_PING),
        Err(NlbError::Route(RouteError::NoHealthyModules(Protocol::Redis)))
    ));

    nlb.router().unregister_module(Protocol::Redis, "cache-1").unwrap();
    nlb.router().unregister_module(Protocol::Redis, "cache-2").unwrap();
    assert!(matches!(
        nlb.route(REDIS_PING),
        Err(NlbError::Route(RouteError::NoModulesRegistered(Protocol::Redis)))
    ));
    assert_eq!(
        sink.counter(ROUTING_ERRORS, &[("protocol", "Redis"), ("error_type", "no_module")]),
        2
    );
}

#[tokio::test]
async fn test_unknown_bytes_are_not_routed() {
    let (nlb, sink) = build_nlb(NlbConfig::default());
    nlb.router().register_module(module("web", Protocol::Http, 0)).unwrap();

    let err = nlb.route(b"\xff\xfe\xfd\xfc hello").unwrap_err();
    assert!(matches!(err, NlbError::Route(RouteError::ProtocolUnknown)));
    assert!(!err.is_retryable());
    assert_eq!(
        sink.counter(
            ROUTING_ERRORS,
            &[("protocol", "unknown"), ("error_type", "unknown_protocol")]
        ),
        1
    );
}

#[tokio::test]
async fn test_rate_limit_metrics_per_protocol_bucket() {
    let mut config = NlbConfig::default();
    config.rate_limit.default_capacity = 3.0;
    config.rate_limit.default_refill_rate = 0.001;
    let (nlb, sink) = build_nlb(config);
    nlb.router().register_module(module("web", Protocol::Http, 0)).unwrap();
    nlb.router().register_module(module("cache", Protocol::Redis, 0)).unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(nlb.route(HTTP_GET).unwrap());
    }
    assert!(matches!(nlb.route(HTTP_GET), Err(NlbError::RateLimited { .. })));

    // Redis has its own bucket.
    held.push(nlb.route(REDIS_PING).unwrap());

    let http = [("protocol", "HTTP"), ("bucket", "http")];
    assert_eq!(sink.counter(RATELIMIT_ALLOWED, &http), 3);
    assert_eq!(sink.counter(RATELIMIT_DENIED, &http), 1);
    assert_eq!(
        sink.counter(RATELIMIT_ALLOWED, &[("protocol", "Redis"), ("bucket", "redis")]),
        1
    );
}

#[tokio::test]
async fn test_disabled_rate_limit_never_denies() {
    let mut config = NlbConfig::default();
    config.rate_limit.enabled = false;
    let (nlb, sink) = build_nlb(config);
    nlb.router().register_module(module("web", Protocol::Http, 0)).unwrap();

    assert!(nlb.rate_limiter().bucket_names().is_empty());
    for _ in 0..50 {
        nlb.route(HTTP_GET).unwrap().release();
    }
    assert_eq!(sink.counter_total(RATELIMIT_ALLOWED), 0);
}
