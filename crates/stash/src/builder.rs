//! # Builder for StashConfig
//!
//! Fluent construction of [`StashConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stash_engine::StashConfig;
//!
//! let config = StashConfig::builder()
//!     .with_cache_dir("/tmp/my-app-assets")
//!     .with_max_memory_bytes(16 * 1024 * 1024)
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_self_signed_host("images.intranet")
//!     .with_background_caching(false)
//!     .build();
//!
//! assert!(!config.background_caching);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::HeaderValue;

use crate::StashConfig;
use crate::cache::CacheConfig;
use crate::config::{MonitorConfig, SchedulerConfig};

/// Builder for creating StashConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct StashConfigBuilder {
    config: StashConfig,
}

impl StashConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: StashConfig::default(),
        }
    }

    /// Replace the whole cache configuration
    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Directory that holds durable-tier files and the index
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.cache_dir = Some(dir.into());
        self
    }

    /// Soft byte budget for the memory tier
    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.config.cache.max_memory_bytes = bytes;
        self
    }

    /// Enable or disable caching entirely
    pub fn with_caching_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    /// Set the overall request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.network.timeout = timeout;
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.network.connect_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.network.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.network.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header, ignoring invalid names or values
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.network.headers.insert(name, value);
        }
        self
    }

    /// Accept self-signed certificates presented by `host`
    ///
    /// # Warning
    /// Only intended for hosts under the caller's control.
    pub fn with_self_signed_host(mut self, host: impl Into<String>) -> Self {
        self.config.network.self_signed_hosts.push(host.into());
        self
    }

    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    pub fn with_monitor_config(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    /// Whether prefetching continues while the host is inactive
    pub fn with_background_caching(mut self, enabled: bool) -> Self {
        self.config.background_caching = enabled;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Build the StashConfig instance
    pub fn build(self) -> StashConfig {
        self.config
    }
}

impl Default for StashConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = StashConfigBuilder::new().build();
        assert_eq!(config.network.connect_timeout, Duration::from_secs(10));
        assert!(config.network.follow_redirects);
        assert!(config.network.self_signed_hosts.is_empty());
        assert!(config.background_caching);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_builder_customization() {
        let config = StashConfigBuilder::new()
            .with_cache_dir("/var/cache/assets")
            .with_max_memory_bytes(1024)
            .with_timeout(Duration::from_secs(60))
            .with_follow_redirects(false)
            .with_user_agent("CustomAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_self_signed_host("dev.local")
            .with_background_caching(false)
            .build();

        assert_eq!(config.cache_dir(), PathBuf::from("/var/cache/assets"));
        assert_eq!(config.cache.max_memory_bytes, 1024);
        assert_eq!(config.network.timeout, Duration::from_secs(60));
        assert!(!config.network.follow_redirects);
        assert_eq!(config.network.user_agent, "CustomAgent/1.0");
        assert!(config.network.allows_self_signed("dev.local"));
        assert!(!config.background_caching);

        let header_value = config.network.headers.get("X-Custom-Header").unwrap();
        assert_eq!(header_value.to_str().unwrap(), "CustomValue");
    }

    #[test]
    fn test_invalid_header_is_ignored() {
        let config = StashConfigBuilder::new()
            .with_header("bad header", "value")
            .build();
        assert!(config.network.headers.get("bad header").is_none());
    }
}
