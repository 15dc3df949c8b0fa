//! Client configuration types and builders.

use std::sync::Arc;
use std::time::Duration;

use hotrod_core::protocol::MediaType;
use hotrod_core::{ClientIntelligence, HotRodError, KeyHasher, Murmur3Hasher, ProtocolVersion, ServerAddress};

use crate::cache::NearCacheConfig;

/// Default server host.
const DEFAULT_HOST: &str = "127.0.0.1";
/// Default Hot Rod port.
const DEFAULT_PORT: u16 = 11222;
/// Default connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-call deadline.
const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
/// Default initial retry backoff.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
/// Default maximum retry backoff.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);
/// Default retry multiplier.
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
/// Default jitter applied to each backoff.
const DEFAULT_RETRY_JITTER: f64 = 0.2;
/// Default maximum retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default maximum connections per server.
const DEFAULT_MAX_ACTIVE: u32 = 8;
/// Default number of borrowers allowed to wait for a connection per server.
const DEFAULT_MAX_PENDING: u32 = 256;
/// Default idle time after which pooled connections are closed.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default idle time after which pooled connections are pinged before use.
const DEFAULT_HEALTH_CHECK_THRESHOLD: Duration = Duration::from_secs(30);

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for HotRodError {
    fn from(err: ConfigError) -> Self {
        HotRodError::Configuration(err.message)
    }
}

/// Retry policy applied by the dispatcher.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: f64,
    max_retries: u32,
}

impl RetryConfig {
    /// Returns the initial backoff duration.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the maximum backoff duration.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the backoff multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the jitter factor, a fraction of the backoff.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Returns the number of retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: DEFAULT_RETRY_JITTER,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    max_retries: Option<u32>,
}

impl RetryConfigBuilder {
    /// Creates a new retry configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial backoff duration.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Sets the maximum backoff duration.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Sets the backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the jitter factor, between 0.0 and 1.0.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Sets the number of retries after the first attempt.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Builds the retry configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `initial_backoff` exceeds `max_backoff`
    /// - `multiplier` is less than 1.0
    /// - `jitter` is outside `0.0..=1.0`
    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        let initial_backoff = self.initial_backoff.unwrap_or(DEFAULT_INITIAL_BACKOFF);
        let max_backoff = self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF);
        let multiplier = self.multiplier.unwrap_or(DEFAULT_RETRY_MULTIPLIER);
        let jitter = self.jitter.unwrap_or(DEFAULT_RETRY_JITTER);
        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        if initial_backoff > max_backoff {
            return Err(ConfigError::new(
                "initial_backoff must not exceed max_backoff",
            ));
        }

        if multiplier < 1.0 {
            return Err(ConfigError::new("multiplier must be at least 1.0"));
        }

        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::new("jitter must be between 0.0 and 1.0"));
        }

        Ok(RetryConfig {
            initial_backoff,
            max_backoff,
            multiplier,
            jitter,
            max_retries,
        })
    }
}

/// Per-server connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    max_active: u32,
    max_pending: u32,
    idle_timeout: Duration,
    health_check_threshold: Duration,
}

impl PoolConfig {
    /// Returns the maximum number of connections per server.
    pub fn max_active(&self) -> u32 {
        self.max_active
    }

    /// Returns how many borrowers may wait for a connection per server.
    pub fn max_pending(&self) -> u32 {
        self.max_pending
    }

    /// Returns the idle time after which pooled connections are closed.
    ///
    /// `Duration::ZERO` keeps idle connections forever.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the idle time after which a connection is pinged before reuse.
    pub fn health_check_threshold(&self) -> Duration {
        self.health_check_threshold
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: DEFAULT_MAX_ACTIVE,
            max_pending: DEFAULT_MAX_PENDING,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_check_threshold: DEFAULT_HEALTH_CHECK_THRESHOLD,
        }
    }
}

/// Builder for `PoolConfig`.
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    max_active: Option<u32>,
    max_pending: Option<u32>,
    idle_timeout: Option<Duration>,
    health_check_threshold: Option<Duration>,
}

impl PoolConfigBuilder {
    /// Creates a new pool configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of connections per server.
    pub fn max_active(mut self, max_active: u32) -> Self {
        self.max_active = Some(max_active);
        self
    }

    /// Sets how many borrowers may wait for a connection per server.
    pub fn max_pending(mut self, max_pending: u32) -> Self {
        self.max_pending = Some(max_pending);
        self
    }

    /// Sets the idle time after which pooled connections are closed.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the idle time after which a connection is pinged before reuse.
    pub fn health_check_threshold(mut self, threshold: Duration) -> Self {
        self.health_check_threshold = Some(threshold);
        self
    }

    /// Builds the pool configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `max_active` is zero.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let max_active = self.max_active.unwrap_or(DEFAULT_MAX_ACTIVE);
        if max_active == 0 {
            return Err(ConfigError::new("max_active must be greater than zero"));
        }

        Ok(PoolConfig {
            max_active,
            max_pending: self.max_pending.unwrap_or(DEFAULT_MAX_PENDING),
            idle_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            health_check_threshold: self
                .health_check_threshold
                .unwrap_or(DEFAULT_HEALTH_CHECK_THRESHOLD),
        })
    }
}

/// Main client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    servers: Vec<ServerAddress>,
    protocol_version: ProtocolVersion,
    intelligence: ClientIntelligence,
    connect_timeout: Duration,
    socket_timeout: Duration,
    tcp_no_delay: bool,
    force_return_values: bool,
    key_media_type: MediaType,
    value_media_type: MediaType,
    hasher: Arc<dyn KeyHasher>,
    retry: RetryConfig,
    pool: PoolConfig,
    near_caches: Vec<NearCacheConfig>,
}

impl ClientConfig {
    /// Creates a new client configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the bootstrap servers.
    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    /// Returns the protocol version spoken to servers.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Returns the client intelligence level.
    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    /// Returns the TCP connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the per-call deadline.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    /// Returns whether `TCP_NODELAY` is set on new connections.
    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    /// Returns whether writes ask for the previous value by default.
    pub fn force_return_values(&self) -> bool {
        self.force_return_values
    }

    /// Returns the media type announced for keys.
    pub fn key_media_type(&self) -> &MediaType {
        &self.key_media_type
    }

    /// Returns the media type announced for values.
    pub fn value_media_type(&self) -> &MediaType {
        &self.value_media_type
    }

    /// Returns the key hash function used for routing.
    pub fn hasher(&self) -> Arc<dyn KeyHasher> {
        Arc::clone(&self.hasher)
    }

    /// Returns the retry configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the connection pool configuration.
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Returns the near-cache configurations.
    pub fn near_caches(&self) -> &[NearCacheConfig] {
        &self.near_caches
    }

    /// Finds a near-cache configuration matching the given cache name.
    pub fn find_near_cache(&self, cache_name: &str) -> Option<&NearCacheConfig> {
        self.near_caches.iter().find(|nc| nc.matches(cache_name))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerAddress::new(DEFAULT_HOST, DEFAULT_PORT)],
            protocol_version: ProtocolVersion::default(),
            intelligence: ClientIntelligence::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            tcp_no_delay: true,
            force_return_values: false,
            key_media_type: MediaType::Unspecified,
            value_media_type: MediaType::Unspecified,
            hasher: Arc::new(Murmur3Hasher::default()),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
            near_caches: Vec::new(),
        }
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    servers: Vec<ServerAddress>,
    protocol_version: Option<ProtocolVersion>,
    intelligence: Option<ClientIntelligence>,
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    tcp_no_delay: Option<bool>,
    force_return_values: Option<bool>,
    key_media_type: Option<MediaType>,
    value_media_type: Option<MediaType>,
    hasher: Option<Arc<dyn KeyHasher>>,
    retry: RetryConfigBuilder,
    pool: PoolConfigBuilder,
    near_caches: Vec<NearCacheConfig>,
}

impl ClientConfigBuilder {
    /// Creates a new client configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bootstrap server.
    pub fn add_server(mut self, server: ServerAddress) -> Self {
        self.servers.push(server);
        self
    }

    /// Sets the bootstrap servers, replacing any added before.
    pub fn servers(mut self, servers: impl IntoIterator<Item = ServerAddress>) -> Self {
        self.servers = servers.into_iter().collect();
        self
    }

    /// Sets the protocol version.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = Some(version);
        self
    }

    /// Sets the client intelligence level.
    pub fn intelligence(mut self, intelligence: ClientIntelligence) -> Self {
        self.intelligence = Some(intelligence);
        self
    }

    /// Sets the TCP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-call deadline, covering every retry of the call.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Sets whether `TCP_NODELAY` is set on new connections.
    pub fn tcp_no_delay(mut self, enabled: bool) -> Self {
        self.tcp_no_delay = Some(enabled);
        self
    }

    /// Sets whether writes ask for the previous value by default.
    pub fn force_return_values(mut self, enabled: bool) -> Self {
        self.force_return_values = Some(enabled);
        self
    }

    /// Sets the media types announced for keys and values.
    pub fn media_types(mut self, key: MediaType, value: MediaType) -> Self {
        self.key_media_type = Some(key);
        self.value_media_type = Some(value);
        self
    }

    /// Sets the key hash function. It must match the servers' function.
    pub fn hasher(mut self, hasher: Arc<dyn KeyHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Configures retry settings using a builder function.
    pub fn retry<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RetryConfigBuilder) -> RetryConfigBuilder,
    {
        self.retry = f(self.retry);
        self
    }

    /// Configures connection pool settings using a builder function.
    pub fn connection_pool<F>(mut self, f: F) -> Self
    where
        F: FnOnce(PoolConfigBuilder) -> PoolConfigBuilder,
    {
        self.pool = f(self.pool);
        self
    }

    /// Sets the number of retries after the first attempt.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry = self.retry.max_retries(max_retries);
        self
    }

    /// Adds a near-cache configuration.
    ///
    /// Several configurations may be added, each matching different cache
    /// name patterns; the first match wins.
    pub fn add_near_cache_config(mut self, config: NearCacheConfig) -> Self {
        self.near_caches.push(config);
        self
    }

    /// Builds the client configuration, returning an error if validation fails.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let defaults = ClientConfig::default();
        let servers = if self.servers.is_empty() {
            defaults.servers
        } else {
            self.servers
        };

        let socket_timeout = self.socket_timeout.unwrap_or(defaults.socket_timeout);
        if socket_timeout.is_zero() {
            return Err(ConfigError::new("socket_timeout must be greater than zero"));
        }
        let connect_timeout = self.connect_timeout.unwrap_or(defaults.connect_timeout);
        if connect_timeout.is_zero() {
            return Err(ConfigError::new("connect_timeout must be greater than zero"));
        }

        let retry = self.retry.build()?;
        let pool = self.pool.build()?;

        Ok(ClientConfig {
            servers,
            protocol_version: self.protocol_version.unwrap_or(defaults.protocol_version),
            intelligence: self.intelligence.unwrap_or(defaults.intelligence),
            connect_timeout,
            socket_timeout,
            tcp_no_delay: self.tcp_no_delay.unwrap_or(defaults.tcp_no_delay),
            force_return_values: self
                .force_return_values
                .unwrap_or(defaults.force_return_values),
            key_media_type: self.key_media_type.unwrap_or(defaults.key_media_type),
            value_media_type: self.value_media_type.unwrap_or(defaults.value_media_type),
            hasher: self.hasher.unwrap_or(defaults.hasher),
            retry,
            pool,
            near_caches: self.near_caches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.servers(), &[ServerAddress::new("127.0.0.1", 11222)]);
        assert_eq!(config.protocol_version(), ProtocolVersion::LATEST);
        assert_eq!(
            config.intelligence(),
            ClientIntelligence::HashDistributionAware
        );
        assert!(config.tcp_no_delay());
        assert_eq!(config.retry().max_retries(), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_builder_add_server() {
        let config = ClientConfig::builder()
            .add_server(ServerAddress::new("10.0.0.1", 11222))
            .add_server(ServerAddress::new("10.0.0.2", 11222))
            .build()
            .unwrap();
        assert_eq!(config.servers().len(), 2);
    }

    #[test]
    fn test_builder_servers_replaces() {
        let config = ClientConfig::builder()
            .add_server(ServerAddress::new("10.0.0.1", 11222))
            .servers([ServerAddress::new("10.0.0.9", 11222)])
            .build()
            .unwrap();
        assert_eq!(config.servers(), &[ServerAddress::new("10.0.0.9", 11222)]);
    }

    #[test]
    fn test_builder_zero_socket_timeout_fails() {
        let result = ClientConfig::builder()
            .socket_timeout(Duration::ZERO)
            .build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("socket_timeout must be greater than zero"));
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfigBuilder::new()
            .initial_backoff(Duration::from_millis(200))
            .max_backoff(Duration::from_secs(60))
            .multiplier(1.5)
            .jitter(0.0)
            .max_retries(5)
            .build()
            .unwrap();

        assert_eq!(config.initial_backoff(), Duration::from_millis(200));
        assert_eq!(config.max_backoff(), Duration::from_secs(60));
        assert_eq!(config.multiplier(), 1.5);
        assert_eq!(config.jitter(), 0.0);
        assert_eq!(config.max_retries(), 5);
    }

    #[test]
    fn test_retry_initial_exceeds_max_fails() {
        let result = RetryConfigBuilder::new()
            .initial_backoff(Duration::from_secs(60))
            .max_backoff(Duration::from_secs(10))
            .build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("initial_backoff must not exceed max_backoff"));
    }

    #[test]
    fn test_retry_invalid_jitter_fails() {
        assert!(RetryConfigBuilder::new().jitter(1.5).build().is_err());
        assert!(RetryConfigBuilder::new().multiplier(0.5).build().is_err());
    }

    #[test]
    fn test_pool_config_defaults_and_validation() {
        let config = PoolConfigBuilder::new().build().unwrap();
        assert_eq!(config.max_active(), DEFAULT_MAX_ACTIVE);
        assert_eq!(config.idle_timeout(), DEFAULT_IDLE_TIMEOUT);

        let result = PoolConfigBuilder::new().max_active(0).build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_active must be greater than zero"));
    }

    #[test]
    fn test_fluent_sub_builder_api() {
        let config = ClientConfig::builder()
            .protocol_version(ProtocolVersion::V2_8)
            .connection_pool(|p| p.max_active(2).max_pending(4))
            .retry(|r| r.max_retries(7).multiplier(1.5))
            .build()
            .unwrap();

        assert_eq!(config.protocol_version(), ProtocolVersion::V2_8);
        assert_eq!(config.pool().max_active(), 2);
        assert_eq!(config.pool().max_pending(), 4);
        assert_eq!(config.retry().max_retries(), 7);
    }

    #[test]
    fn test_find_near_cache() {
        let config = ClientConfig::builder()
            .add_near_cache_config(NearCacheConfig::builder("users-*").build().unwrap())
            .build()
            .unwrap();
        assert!(config.find_near_cache("users-eu").is_some());
        assert!(config.find_near_cache("orders").is_none());
    }

    #[test]
    fn test_config_error_display_and_conversion() {
        let err = ConfigError::new("test error");
        assert_eq!(err.to_string(), "configuration error: test error");
        let converted: HotRodError = err.into();
        assert!(matches!(converted, HotRodError::Configuration(m) if m == "test error"));
    }

    #[test]
    fn test_client_config_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClientConfig>();
        assert_send_sync::<ConfigError>();
    }
}
