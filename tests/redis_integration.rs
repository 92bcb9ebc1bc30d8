//! Integration tests for the Redis counter-store backend.
//!
//! These tests require Docker (via testcontainers) and are skipped in
//! environments without Docker by simply failing at container startup.
//!
//! Run with: `cargo test --test redis_integration`

use edge_gateway::config::MetricsConfig;
use edge_gateway::store::{CounterStore, RedisStore, StoreOp};
use edge_gateway::telemetry::{MetricsRecorder, RequestSample};
use std::sync::Arc;
use std::time::Duration;

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

async fn start_redis() -> (RedisStore, String, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379_u16.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("failed to start redis container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(6379).await.expect("get port");
    let url = format!("redis://{}:{}", host, port);

    let store = RedisStore::connect(&url, Duration::from_secs(2))
        .await
        .expect("connect to redis");
    (store, url, container)
}

async fn raw_conn(url: &str) -> redis::aio::MultiplexedConnection {
    redis::Client::open(url)
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_incr_sets_ttl_on_first_write_only() {
    let (store, url, _container) = start_redis().await;

    assert_eq!(store.incr_with_ttl("w:count", 1, 300).await.unwrap(), 1);
    let ttl = store.ttl("w:count").await.unwrap().unwrap();
    assert!(ttl > 290 && ttl <= 300);

    // A later write must not refresh the expiry.
    let mut conn = raw_conn(&url).await;
    let _: () = redis::cmd("EXPIRE")
        .arg("w:count")
        .arg(100)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(store.incr_with_ttl("w:count", 1, 300).await.unwrap(), 2);
    assert!(store.ttl("w:count").await.unwrap().unwrap() <= 100);

    // Latency sums start above one and still get their expiry.
    assert_eq!(store.incr_with_ttl("w:latency", 120, 300).await.unwrap(), 120);
    assert!(store.ttl("w:latency").await.unwrap().is_some());
}

#[tokio::test]
async fn test_set_if_absent_single_winner() {
    let (store, _url, _container) = start_redis().await;
    let store = Arc::new(store);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.set_if_absent("gateway:nonce:abc", "1", 300).await })
        })
        .collect();

    let mut winners = 0;
    for t in tasks {
        if t.await.unwrap().unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get("gateway:nonce:abc").await.unwrap().as_deref(), Some("1"));
    assert!(store.ttl("gateway:nonce:abc").await.unwrap().is_some());
}

#[tokio::test]
async fn test_rank_trimmed_to_top_ten() {
    let (store, _url, _container) = start_redis().await;

    for i in 0..15u32 {
        for _ in 0..=i {
            store.zincr("rank", &format!("route-{}", i), 1.0).await.unwrap();
        }
    }
    let removed = store.ztrim_top("rank", 10).await.unwrap();
    assert_eq!(removed, 5);

    let top = store.ztop("rank", 20).await.unwrap();
    assert_eq!(top.len(), 10);
    assert_eq!(top[0], ("route-14".to_string(), 15.0));
    assert_eq!(top[9].0, "route-5");
}

#[tokio::test]
async fn test_recent_list_capped() {
    let (store, _url, _container) = start_redis().await;

    for i in 0..60 {
        store
            .list_push_trim("gateway:dashboard:logs", &format!("e{}", i), 50)
            .await
            .unwrap();
    }
    let all = store.list_range("gateway:dashboard:logs", 0, -1).await.unwrap();
    assert_eq!(all.len(), 50);
    assert_eq!(all[0], "e59");
    assert_eq!(all[49], "e10");
}

#[tokio::test]
async fn test_enqueue_appends_to_stream() {
    let (store, url, _container) = start_redis().await;

    store.enqueue("gateway_log_queue", r#"{"path":"/a"}"#).await.unwrap();
    store.enqueue("gateway_log_queue", r#"{"path":"/b"}"#).await.unwrap();

    let mut conn = raw_conn(&url).await;
    let len: u64 = redis::cmd("XLEN")
        .arg("gateway_log_queue")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(len, 2);
}

#[tokio::test]
async fn test_recorder_batch_against_redis() {
    let (store, _url, _container) = start_redis().await;
    let store = Arc::new(store);
    let recorder = MetricsRecorder::new(store.clone(), MetricsConfig::default());
    let now = chrono::Local::now();

    for (status, latency) in [(200, 10), (200, 30), (503, 50)] {
        let sample = RequestSample {
            status,
            latency_ms: latency,
            route_id: Some("user".into()),
        };
        recorder.record(&sample, &now).await.unwrap();
    }

    let keys = recorder.window_keys(&now);
    let values = store
        .get_many(&[keys.req_count.clone(), keys.latency_sum, keys.error_count, keys.qps.clone()])
        .await
        .unwrap();
    assert_eq!(values[0].as_deref(), Some("3"));
    assert_eq!(values[1].as_deref(), Some("90"));
    assert_eq!(values[2].as_deref(), Some("1"));
    assert_eq!(values[3].as_deref(), Some("3"));
    assert!(store.ttl(&keys.req_count).await.unwrap().unwrap() <= 300);
    assert!(store.ttl(&keys.qps).await.unwrap().unwrap() <= 60);

    let snapshot = recorder.snapshot(&now).await.unwrap();
    assert_eq!(snapshot.latency, 30);
    assert_eq!(snapshot.error_rate, "33.33%");
    assert_eq!(snapshot.top_routes[0].name, "user");
}

#[tokio::test]
async fn test_apply_expire_op() {
    let (store, _url, _container) = start_redis().await;

    store
        .apply(vec![
            StoreOp::ZIncr {
                key: "r".into(),
                member: "a".into(),
                delta: 1.0,
            },
            StoreOp::Expire {
                key: "r".into(),
                ttl_secs: 3600,
            },
        ])
        .await
        .unwrap();
    let ttl = store.ttl("r").await.unwrap().unwrap();
    assert!(ttl > 3500);
}
