//! End-to-end scenarios through the full request pipeline: mock origin,
//! compiled routes, cache, and rate limiting, all in-process.

use crate::mock_upstream;
use axum::body::Body;
use hermyx_core::{
    config::{
        CacheConfig, CacheKeyConfig, HermyxConfig, KeyComponent, RateLimitConfig,
        RateLimitHeadersConfig, RouteConfig,
    },
    proxy::ProxyEngine,
    runtime,
};
use http::{Request, Response, StatusCode};
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

fn cache_key_config(components: Vec<KeyComponent>) -> CacheKeyConfig {
    CacheKeyConfig { components, exclude_methods: vec![], headers: vec![] }
}

fn cached_route(name: &str, path: &str, target: &str) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        path: path.to_string(),
        target: target.to_string(),
        cache: Some(CacheConfig {
            enabled: true,
            ttl: Some(Duration::from_secs(120)),
            key_config: Some(cache_key_config(vec![KeyComponent::Path, KeyComponent::Query])),
            ..CacheConfig::default()
        }),
        ..RouteConfig::default()
    }
}

async fn build_engine(storage: &Path, config: &mut HermyxConfig) -> Arc<ProxyEngine> {
    config.storage.path = Some(storage.to_path_buf());
    if config.cache.capacity.is_none() {
        config.cache.capacity = Some(100);
    }
    if let Some(rate_limit) = config.rate_limit.as_mut() {
        rate_limit.apply_defaults();
    }
    config.validate().expect("test config must validate");
    runtime::build_engine(config).await.expect("engine build failed")
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn remote() -> Option<SocketAddr> {
    Some("203.0.113.50:40000".parse().unwrap())
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn second_request_is_a_cache_hit() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut config = HermyxConfig {
        routes: vec![cached_route("time", "^/time", &upstream.to_string())],
        ..HermyxConfig::default()
    };
    let engine = build_engine(storage.path(), &mut config).await;

    let first = engine.handle(get_request("/time"), remote()).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-hermyx-cache").unwrap(), "MISS");
    let first_body = body_string(first).await;

    let second = engine.handle(get_request("/time"), remote()).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-hermyx-cache").unwrap(), "HIT");

    // The origin increments on every real request; identical bodies prove
    // the second response came from the cache.
    assert_eq!(body_string(second).await, first_body);

    engine.shutdown().await;
}

#[tokio::test]
async fn distinct_queries_get_distinct_cache_entries() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut config = HermyxConfig {
        routes: vec![cached_route("echo", "^/echo", &upstream.to_string())],
        ..HermyxConfig::default()
    };
    let engine = build_engine(storage.path(), &mut config).await;

    let a = engine.handle(get_request("/echo?msg=a"), remote()).await;
    assert_eq!(a.headers().get("x-hermyx-cache").unwrap(), "MISS");
    assert_eq!(body_string(a).await, "Echo: a");

    let b = engine.handle(get_request("/echo?msg=b"), remote()).await;
    assert_eq!(b.headers().get("x-hermyx-cache").unwrap(), "MISS");
    assert_eq!(body_string(b).await, "Echo: b");

    let a_again = engine.handle(get_request("/echo?msg=a"), remote()).await;
    assert_eq!(a_again.headers().get("x-hermyx-cache").unwrap(), "HIT");
    assert_eq!(body_string(a_again).await, "Echo: a");

    engine.shutdown().await;
}

#[tokio::test]
async fn oversized_responses_are_never_cached() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut route = cached_route("exceed", "^/exceed", &upstream.to_string());
    if let Some(cache) = route.cache.as_mut() {
        // Ceiling far below the ~1.5 MB body.
        cache.max_content_size = Some(1024);
    }
    let mut config = HermyxConfig { routes: vec![route], ..HermyxConfig::default() };
    let engine = build_engine(storage.path(), &mut config).await;

    let first = engine.handle(get_request("/exceed"), remote()).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-hermyx-cache").unwrap(), "MISS");

    let second = engine.handle(get_request("/exceed"), remote()).await;
    assert_eq!(second.headers().get("x-hermyx-cache").unwrap(), "MISS");

    engine.shutdown().await;
}

#[tokio::test]
async fn strict_rate_limit_denies_the_third_request() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut config = HermyxConfig {
        rate_limit: Some(RateLimitConfig {
            enabled: true,
            requests: Some(2),
            window: Some(Duration::from_secs(60)),
            headers: Some(RateLimitHeadersConfig {
                include_remaining: true,
                include_reset: true,
                include_limit: true,
            }),
            ..RateLimitConfig::default()
        }),
        routes: vec![RouteConfig {
            name: "get".to_string(),
            path: "^/hello".to_string(),
            target: upstream.to_string(),
            ..RouteConfig::default()
        }],
        ..HermyxConfig::default()
    };
    let engine = build_engine(storage.path(), &mut config).await;

    for _ in 0..2 {
        let response = engine.handle(get_request("/hello"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Hello, world!");
    }

    let denied = engine.handle(get_request("/hello"), remote()).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers().get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(denied.headers().get("x-ratelimit-limit").unwrap(), "2");

    let retry_after: u64 =
        denied.headers().get("retry-after").unwrap().to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0);

    assert_eq!(body_string(denied).await, "Rate limit exceeded");

    engine.shutdown().await;
}

#[tokio::test]
async fn header_keyed_clients_are_isolated() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut config = HermyxConfig {
        rate_limit: Some(RateLimitConfig {
            enabled: true,
            requests: Some(3),
            window: Some(Duration::from_secs(60)),
            key_by: vec!["header:X-API-Key".to_string()],
            ..RateLimitConfig::default()
        }),
        routes: vec![RouteConfig {
            name: "hello".to_string(),
            path: "^/hello".to_string(),
            target: upstream.to_string(),
            ..RouteConfig::default()
        }],
        ..HermyxConfig::default()
    };
    let engine = build_engine(storage.path(), &mut config).await;

    let keyed_request = |key: &str| {
        Request::builder()
            .uri("/hello")
            .header("x-api-key", key)
            .body(Body::empty())
            .unwrap()
    };

    // Client A exhausts its quota of three.
    for _ in 0..3 {
        let response = engine.handle(keyed_request("A"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let denied = engine.handle(keyed_request("A"), remote()).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    // Client B's quota is untouched.
    let response = engine.handle(keyed_request("B"), remote()).await;
    assert_eq!(response.status(), StatusCode::OK);

    engine.shutdown().await;
}

#[tokio::test]
async fn rate_limit_applies_to_methods_the_cache_excludes() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut route = cached_route("hello", "^/hello", &upstream.to_string());
    if let Some(cache) = route.cache.as_mut() {
        if let Some(key) = cache.key_config.as_mut() {
            key.exclude_methods = vec!["get".to_string()];
        }
    }
    route.rate_limit = Some(RateLimitConfig {
        enabled: true,
        requests: Some(1),
        window: Some(Duration::from_secs(60)),
        ..RateLimitConfig::default()
    });

    let mut config = HermyxConfig { routes: vec![route], ..HermyxConfig::default() };
    let engine = build_engine(storage.path(), &mut config).await;

    // GET is cache-excluded, so without a Host header the request falls
    // through to the 404 fallback — but it still consumed a token.
    let first = engine.handle(get_request("/hello"), remote()).await;
    assert_eq!(first.status(), StatusCode::NOT_FOUND);

    let second = engine.handle(get_request("/hello"), remote()).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    engine.shutdown().await;
}

#[tokio::test]
async fn unmatched_request_with_host_is_proxied_to_that_host() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut config = HermyxConfig::default();
    let engine = build_engine(storage.path(), &mut config).await;

    let request = Request::builder()
        .uri("/hello")
        .header("host", upstream.to_string())
        .body(Body::empty())
        .unwrap();

    let response = engine.handle(request, remote()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "Hello, world!");

    engine.shutdown().await;
}

#[tokio::test]
async fn disabled_route_cache_always_dispatches() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    let mut config = HermyxConfig {
        routes: vec![RouteConfig {
            name: "time".to_string(),
            path: "^/time".to_string(),
            target: upstream.to_string(),
            cache: Some(CacheConfig { enabled: false, ..CacheConfig::default() }),
            ..RouteConfig::default()
        }],
        ..HermyxConfig::default()
    };
    let engine = build_engine(storage.path(), &mut config).await;

    let first = body_string(engine.handle(get_request("/time"), remote()).await).await;
    let second = body_string(engine.handle(get_request("/time"), remote()).await).await;
    assert_ne!(first, second, "uncached responses must hit the origin each time");

    engine.shutdown().await;
}
