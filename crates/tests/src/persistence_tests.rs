//! Disk-cache persistence across engine restarts.

use crate::mock_upstream;
use axum::body::Body;
use hermyx_core::{
    config::{CacheBackendKind, CacheConfig, CacheKeyConfig, HermyxConfig, KeyComponent, RouteConfig},
    runtime,
};
use http::{Request, StatusCode};
use std::{path::Path, time::Duration};

fn disk_config(storage: &Path, target: &str) -> HermyxConfig {
    HermyxConfig {
        storage: hermyx_core::config::StorageConfig { path: Some(storage.to_path_buf()) },
        cache: CacheConfig {
            backend: Some(CacheBackendKind::Disk),
            capacity: Some(100),
            ..CacheConfig::default()
        },
        routes: vec![RouteConfig {
            name: "hello".to_string(),
            path: "^/hello".to_string(),
            target: target.to_string(),
            cache: Some(CacheConfig {
                enabled: true,
                ttl: Some(Duration::from_secs(600)),
                key_config: Some(CacheKeyConfig {
                    components: vec![KeyComponent::Path, KeyComponent::Query],
                    ..CacheKeyConfig::default()
                }),
                ..CacheConfig::default()
            }),
            ..RouteConfig::default()
        }],
        ..HermyxConfig::default()
    }
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn disk_cache_survives_an_engine_restart() {
    let (upstream, server) = mock_upstream::spawn().await;
    let storage = tempfile::tempdir().unwrap();

    // First engine: populate the disk cache, then shut down cleanly.
    {
        let config = disk_config(storage.path(), &upstream.to_string());
        let engine = runtime::build_engine(&config).await.unwrap();

        let response = engine.handle(get_request("/hello"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-hermyx-cache").unwrap(), "MISS");

        engine.shutdown().await;
    }

    // The origin is gone: only the disk cache can answer now.
    server.abort();

    let config = disk_config(storage.path(), "127.0.0.1:1");
    let engine = runtime::build_engine(&config).await.unwrap();

    let response = engine.handle(get_request("/hello"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-hermyx-cache").unwrap(), "HIT");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"Hello, world!");

    engine.shutdown().await;
}

#[tokio::test]
async fn separate_storage_dirs_do_not_share_cache_state() {
    let (upstream, _server) = mock_upstream::spawn().await;
    let storage_a = tempfile::tempdir().unwrap();
    let storage_b = tempfile::tempdir().unwrap();

    let engine_a =
        runtime::build_engine(&disk_config(storage_a.path(), &upstream.to_string())).await.unwrap();
    let warmed = engine_a.handle(get_request("/hello"), None).await;
    assert_eq!(warmed.headers().get("x-hermyx-cache").unwrap(), "MISS");
    engine_a.shutdown().await;

    let engine_b =
        runtime::build_engine(&disk_config(storage_b.path(), &upstream.to_string())).await.unwrap();
    let fresh = engine_b.handle(get_request("/hello"), None).await;
    assert_eq!(fresh.headers().get("x-hermyx-cache").unwrap(), "MISS");
    engine_b.shutdown().await;
}
