//! Near-cache coherence against the in-process cluster.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{wait_until, MockCluster};
use hotrod_client::{NearCacheConfig, NearCacheMode, RemoteCacheManager};
use hotrod_core::protocol::constants::GET_WITH_VERSION_REQUEST;

fn near_cache(mode: NearCacheMode) -> NearCacheConfig {
    NearCacheConfig::builder("books")
        .mode(mode)
        .max_size(100)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_modified_event_invalidates_near_cache() {
    let cluster = MockCluster::start(1).await;
    let reader = RemoteCacheManager::new(
        cluster
            .config(&[0])
            .add_near_cache_config(near_cache(NearCacheMode::Invalidated))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    let writer = RemoteCacheManager::new(cluster.config(&[0]).build().unwrap())
        .await
        .unwrap();

    let cached = reader.get_cache("books").await.unwrap();
    let direct = writer.get_cache("books").await.unwrap();
    assert!(cached.has_near_cache());
    assert!(!direct.has_near_cache());

    direct.put("k1", "v1").await.unwrap();
    // Wait for the created event so it cannot race with the first read.
    assert!(wait_until(Duration::from_secs(2), || reader.listener_stats().events_received() >= 1).await);

    assert_eq!(cached.get("k1").await.unwrap(), Some(Bytes::from_static(b"v1")));
    assert_eq!(cached.near_cache_size(), 1);
    assert_eq!(cached.get("k1").await.unwrap(), Some(Bytes::from_static(b"v1")));
    assert_eq!(cluster.received(0, GET_WITH_VERSION_REQUEST).len(), 1);
    let stats = cached.near_cache_stats().unwrap();
    assert_eq!(stats.hits(), 1);
    assert_eq!(stats.misses(), 1);

    direct.put("k1", "v2").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || cached.near_cache_size() == 0).await);
    assert_eq!(cached.get("k1").await.unwrap(), Some(Bytes::from_static(b"v2")));
    assert_eq!(cluster.received(0, GET_WITH_VERSION_REQUEST).len(), 2);

    writer.close().await;
    reader.close().await;
}

#[tokio::test]
async fn test_own_writes_invalidate_immediately() {
    let cluster = MockCluster::start(1).await;
    let manager = RemoteCacheManager::new(
        cluster
            .config(&[0])
            .add_near_cache_config(near_cache(NearCacheMode::Invalidated))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    let cache = manager.get_cache("books").await.unwrap();

    cache.put("k1", "v1").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || manager.listener_stats().events_received() >= 1).await);
    cache.get("k1").await.unwrap();
    assert_eq!(cache.near_cache_size(), 1);

    cache.remove("k1").await.unwrap();
    assert_eq!(cache.near_cache_size(), 0);
    assert_eq!(cache.get("k1").await.unwrap(), None);

    manager.close().await;
}

#[tokio::test]
async fn test_bloom_filtered_near_cache() {
    let cluster = MockCluster::start(1).await;
    let manager = RemoteCacheManager::new(
        cluster
            .config(&[0])
            .add_near_cache_config(near_cache(NearCacheMode::BloomFiltered))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    let cache = manager.get_cache("books").await.unwrap();
    assert_eq!(cluster.listener_count(), 1);

    cache.put("k1", "v1").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || manager.listener_stats().events_received() >= 1).await);

    assert_eq!(cache.get("k1").await.unwrap(), Some(Bytes::from_static(b"v1")));
    assert_eq!(cache.get("k1").await.unwrap(), Some(Bytes::from_static(b"v1")));
    assert_eq!(cache.near_cache_stats().unwrap().hits(), 1);

    manager.close().await;
    assert!(wait_until(Duration::from_secs(2), || cluster.listener_count() == 0).await);
}
