//! Async Rust client for Hot Rod remote cache clusters.
//!
//! The client speaks the Hot Rod binary protocol (versions 2.0 through 3.1)
//! over TCP. It learns the cluster topology from the servers it talks to and
//! routes every key-based request straight to the server that owns the key,
//! retrying on the next owner when a server goes away. It is built on
//! [Tokio](https://tokio.rs/) and exposes every operation as an `async fn`;
//! a blocking facade is available for synchronous callers.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hotrod_client::{ClientConfig, RemoteCacheManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder().build()?;
//!     let manager = RemoteCacheManager::new(config).await?;
//!
//!     let cache = manager.get_cache("books").await?;
//!     cache.put("isbn-1", "Dune").await?;
//!     let value = cache.get("isbn-1").await?;
//!     println!("{:?}", value);
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # What the client does for you
//!
//! | Concern | Where |
//! |---------|-------|
//! | Topology-aware routing | [`routing::ConsistentHashRouter`] picks the primary owner of each key |
//! | Retries and failover | [`dispatcher::Dispatcher`] tries the remaining owners with backoff |
//! | Connection pooling | [`connection::TransportPool`] keeps bounded per-server pools |
//! | Near-caching | [`NearCacheConfig`] keeps hot reads local, invalidated by server events |
//! | Remote events | [`RemoteCache::add_listener`] streams created, modified, removed and expired events |
//! | Iteration | [`RemoteCache::iter`] walks the cache segment by segment, surviving server loss |
//!
//! # Configuration
//!
//! ```rust,no_run
//! use hotrod_client::{ClientConfig, NearCacheConfig, NearCacheMode};
//! use hotrod_client::ServerAddress;
//! use std::time::Duration;
//!
//! let config = ClientConfig::builder()
//!     .add_server(ServerAddress::new("10.0.0.1", 11222))
//!     .add_server(ServerAddress::new("10.0.0.2", 11222))
//!     .connect_timeout(Duration::from_secs(10))
//!     .retry(|r| r
//!         .initial_backoff(Duration::from_millis(100))
//!         .max_backoff(Duration::from_secs(5))
//!         .max_retries(3))
//!     .connection_pool(|p| p.max_active(16))
//!     .add_near_cache_config(
//!         NearCacheConfig::builder("books")
//!             .mode(NearCacheMode::BloomFiltered)
//!             .max_size(10_000)
//!             .build()
//!             .expect("invalid near-cache config"),
//!     )
//!     .build()
//!     .expect("invalid config");
//! ```
//!
//! # Feature Flags
//!
//! | Flag | Purpose |
//! |------|---------|
//! | `metrics` | Prometheus telemetry exporter |

#![warn(missing_docs)]

pub mod blocking;
pub mod cache;
mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod iteration;
pub mod listener;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod operation;
mod remote_cache;
pub mod routing;
pub mod telemetry;

pub use blocking::{BlockingEntryIterator, BlockingListener, BlockingRemoteCache, BlockingRemoteCacheManager};
pub use cache::{EvictionPolicy, NearCacheConfig, NearCacheConfigBuilder, NearCacheMode, NearCacheStats};
pub use client::{RemoteCacheManager, RemoteCacheManagerBuilder};
pub use config::{
    ClientConfig, ClientConfigBuilder, ConfigError, PoolConfig, PoolConfigBuilder, RetryConfig,
    RetryConfigBuilder,
};
pub use connection::{ServerDiscovery, StaticServerDiscovery};
pub use iteration::{EntryIterator, IterationOptions};
pub use listener::{ListenerFilter, ListenerHandle, ListenerId, ListenerStats};
pub use operation::{ServerStatistics, VersionedOutcome, WriteOutcome};
pub use remote_cache::RemoteCache;
pub use telemetry::{CompositeTelemetry, NoopTelemetry, SlowOperationTelemetry, Telemetry};

#[cfg(feature = "metrics")]
pub use metrics::{MetricsError, PrometheusTelemetry};

pub use hotrod_core::protocol::{
    ClientEvent, EventKind, Expiration, IterationEntry, Lifetime, MetadataValue, VersionedValue,
};
pub use hotrod_core::{HotRodError, ProtocolVersion, Result, ServerAddress, Topology};
