//! Near-cache configuration and implementation for client-side caching.

mod bloom;
mod invalidation;
mod near_cache;

pub use bloom::BloomFilter;
pub use invalidation::{InvalidatedNearCache, Reservation};
pub use near_cache::{NearCache, NearCacheStats};

use std::time::Duration;

use crate::config::ConfigError;

/// Default time-to-live for near-cache entries (0 = infinite).
const DEFAULT_TTL: Duration = Duration::ZERO;
/// Default max idle time for near-cache entries (0 = infinite).
const DEFAULT_MAX_IDLE: Duration = Duration::ZERO;
/// Default maximum size of the near-cache.
const DEFAULT_MAX_SIZE: u32 = 10_000;
/// Bloom filter bits reserved per cached entry when no length is configured.
const DEFAULT_BLOOM_BITS_PER_ENTRY: u32 = 16;
/// Fraction of bloom filter changes after which it is rebuilt and shipped.
const DEFAULT_BLOOM_REBUILD_RATIO: f64 = 0.25;

/// How the near-cache learns about remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NearCacheMode {
    /// Every create, modify, remove and expire event for the cache is pushed.
    #[default]
    Invalidated,
    /// The server only pushes events for keys set in a client-shipped bloom
    /// filter. Requires protocol 3.1; older versions fall back to
    /// `Invalidated`.
    BloomFiltered,
}

/// Eviction policy for near-cache when max size is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Least Recently Used - evicts entries that haven't been accessed recently.
    #[default]
    Lru,
    /// Least Frequently Used - evicts entries with the lowest access count.
    Lfu,
    /// Random - evicts entries randomly.
    Random,
    /// None - no eviction; new entries are rejected when cache is full.
    None,
}

/// Configuration for a near-cache associated with a remote cache.
///
/// Near-caches keep recently read entries locally and drop them when the
/// server reports a change, saving a round trip on repeated reads.
#[derive(Debug, Clone)]
pub struct NearCacheConfig {
    name: String,
    mode: NearCacheMode,
    time_to_live: Duration,
    max_idle: Duration,
    max_size: u32,
    eviction_policy: EvictionPolicy,
    bloom_bits: u32,
    bloom_rebuild_ratio: f64,
}

impl NearCacheConfig {
    /// Creates a new near-cache configuration builder.
    pub fn builder(name: impl Into<String>) -> NearCacheConfigBuilder {
        NearCacheConfigBuilder::new(name)
    }

    /// Returns the name pattern for this near-cache.
    ///
    /// The name can be an exact cache name or a wildcard pattern (e.g., "user-*").
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns how remote changes reach this near-cache.
    pub fn mode(&self) -> NearCacheMode {
        self.mode
    }

    /// Returns the time-to-live duration for cached entries.
    ///
    /// A value of `Duration::ZERO` means entries never expire based on time.
    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }

    /// Returns the maximum idle time for cached entries.
    ///
    /// A value of `Duration::ZERO` means entries never expire based on idle time.
    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    /// Returns the maximum number of entries in the near-cache.
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Returns the eviction policy used when the cache is full.
    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy
    }

    /// Returns the bloom filter length in bits.
    pub fn bloom_bits(&self) -> u32 {
        self.bloom_bits
    }

    /// Returns the fraction of changed keys that triggers a filter rebuild.
    pub fn bloom_rebuild_ratio(&self) -> f64 {
        self.bloom_rebuild_ratio
    }

    /// Checks if this configuration matches the given cache name.
    ///
    /// Supports exact matches and simple wildcard patterns with `*` at the end.
    pub fn matches(&self, cache_name: &str) -> bool {
        if self.name.ends_with('*') {
            let prefix = &self.name[..self.name.len() - 1];
            cache_name.starts_with(prefix)
        } else {
            self.name == cache_name
        }
    }
}

/// Builder for `NearCacheConfig`.
#[derive(Debug, Clone)]
pub struct NearCacheConfigBuilder {
    name: String,
    mode: Option<NearCacheMode>,
    time_to_live: Option<Duration>,
    max_idle: Option<Duration>,
    max_size: Option<u32>,
    eviction_policy: Option<EvictionPolicy>,
    bloom_bits: Option<u32>,
    bloom_rebuild_ratio: Option<f64>,
}

impl NearCacheConfigBuilder {
    /// Creates a new near-cache configuration builder with the given name pattern.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: None,
            time_to_live: None,
            max_idle: None,
            max_size: None,
            eviction_policy: None,
            bloom_bits: None,
            bloom_rebuild_ratio: None,
        }
    }

    /// Sets how remote changes reach the near-cache.
    pub fn mode(mut self, mode: NearCacheMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the time-to-live duration for cached entries.
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Sets the maximum idle time for cached entries.
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// Sets the maximum number of entries in the near-cache.
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Sets the eviction policy.
    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    /// Sets the bloom filter length in bits.
    ///
    /// Defaults to 16 bits per entry of `max_size`. Shorter filters produce
    /// more false positives, never false negatives.
    pub fn bloom_bits(mut self, bits: u32) -> Self {
        self.bloom_bits = Some(bits);
        self
    }

    /// Sets the fraction of changed keys after which the filter is rebuilt.
    pub fn bloom_rebuild_ratio(mut self, ratio: f64) -> Self {
        self.bloom_rebuild_ratio = Some(ratio);
        self
    }

    /// Builds the near-cache configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - The name is empty
    /// - `max_size` is zero
    /// - `bloom_bits` is zero
    /// - `bloom_rebuild_ratio` is outside `(0.0, 1.0]`
    pub fn build(self) -> Result<NearCacheConfig, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::new("near-cache name must not be empty"));
        }

        let max_size = self.max_size.unwrap_or(DEFAULT_MAX_SIZE);
        if max_size == 0 {
            return Err(ConfigError::new(
                "near-cache max_size must be greater than zero",
            ));
        }

        let bloom_bits = self
            .bloom_bits
            .unwrap_or_else(|| max_size.saturating_mul(DEFAULT_BLOOM_BITS_PER_ENTRY));
        if bloom_bits == 0 {
            return Err(ConfigError::new(
                "near-cache bloom_bits must be greater than zero",
            ));
        }

        let bloom_rebuild_ratio = self
            .bloom_rebuild_ratio
            .unwrap_or(DEFAULT_BLOOM_REBUILD_RATIO);
        if !(bloom_rebuild_ratio > 0.0 && bloom_rebuild_ratio <= 1.0) {
            return Err(ConfigError::new(
                "near-cache bloom_rebuild_ratio must be in (0.0, 1.0]",
            ));
        }

        Ok(NearCacheConfig {
            name: self.name,
            mode: self.mode.unwrap_or_default(),
            time_to_live: self.time_to_live.unwrap_or(DEFAULT_TTL),
            max_idle: self.max_idle.unwrap_or(DEFAULT_MAX_IDLE),
            max_size,
            eviction_policy: self.eviction_policy.unwrap_or_default(),
            bloom_bits,
            bloom_rebuild_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_cache_config_defaults() {
        let config = NearCacheConfig::builder("test-cache").build().unwrap();

        assert_eq!(config.name(), "test-cache");
        assert_eq!(config.mode(), NearCacheMode::Invalidated);
        assert_eq!(config.time_to_live(), Duration::ZERO);
        assert_eq!(config.max_idle(), Duration::ZERO);
        assert_eq!(config.max_size(), 10_000);
        assert_eq!(config.eviction_policy(), EvictionPolicy::Lru);
        assert_eq!(config.bloom_bits(), 160_000);
        assert_eq!(config.bloom_rebuild_ratio(), 0.25);
    }

    #[test]
    fn test_near_cache_config_custom_values() {
        let config = NearCacheConfig::builder("user-cache")
            .mode(NearCacheMode::BloomFiltered)
            .time_to_live(Duration::from_secs(300))
            .max_idle(Duration::from_secs(60))
            .max_size(5000)
            .eviction_policy(EvictionPolicy::Lfu)
            .bloom_bits(4096)
            .bloom_rebuild_ratio(0.5)
            .build()
            .unwrap();

        assert_eq!(config.mode(), NearCacheMode::BloomFiltered);
        assert_eq!(config.time_to_live(), Duration::from_secs(300));
        assert_eq!(config.max_idle(), Duration::from_secs(60));
        assert_eq!(config.max_size(), 5000);
        assert_eq!(config.eviction_policy(), EvictionPolicy::Lfu);
        assert_eq!(config.bloom_bits(), 4096);
        assert_eq!(config.bloom_rebuild_ratio(), 0.5);
    }

    #[test]
    fn test_near_cache_config_empty_name_fails() {
        let result = NearCacheConfig::builder("").build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("name must not be empty"));
    }

    #[test]
    fn test_near_cache_config_zero_max_size_fails() {
        let result = NearCacheConfig::builder("test").max_size(0).build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_size must be greater than zero"));
    }

    #[test]
    fn test_near_cache_config_bad_bloom_settings_fail() {
        assert!(NearCacheConfig::builder("t").bloom_bits(0).build().is_err());
        assert!(NearCacheConfig::builder("t")
            .bloom_rebuild_ratio(0.0)
            .build()
            .is_err());
        assert!(NearCacheConfig::builder("t")
            .bloom_rebuild_ratio(1.5)
            .build()
            .is_err());
    }

    #[test]
    fn test_near_cache_config_exact_match() {
        let config = NearCacheConfig::builder("user-cache").build().unwrap();

        assert!(config.matches("user-cache"));
        assert!(!config.matches("user-cache-backup"));
        assert!(!config.matches("other-cache"));
    }

    #[test]
    fn test_near_cache_config_wildcard_match() {
        let config = NearCacheConfig::builder("user-*").build().unwrap();

        assert!(config.matches("user-"));
        assert!(config.matches("user-cache"));
        assert!(config.matches("user-data-store"));
        assert!(!config.matches("other-cache"));
        assert!(!config.matches("users"));
    }

    #[test]
    fn test_eviction_policy_default() {
        assert_eq!(EvictionPolicy::default(), EvictionPolicy::Lru);
    }

    #[test]
    fn test_near_cache_config_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NearCacheConfig>();
        assert_send_sync::<NearCacheConfigBuilder>();
        assert_send_sync::<NearCacheMode>();
        assert_send_sync::<EvictionPolicy>();
    }
}
