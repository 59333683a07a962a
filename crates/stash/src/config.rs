use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::cache::CacheConfig;
use crate::monitor::NetworkClassification;

const DEFAULT_USER_AGENT: &str = concat!("stash/", env!("CARGO_PKG_VERSION"));

/// Configurable options for the asset manager
#[derive(Debug, Clone)]
pub struct StashConfig {
    /// Cache tiers configuration
    pub cache: CacheConfig,

    /// HTTP transport configuration
    pub network: NetworkConfig,

    /// Worker pool sizing
    pub scheduler: SchedulerConfig,

    /// Throughput classification
    pub monitor: MonitorConfig,

    /// Whether background-lane prefetching runs while the host is inactive
    pub background_caching: bool,

    /// Capacity of the download event broadcast channel
    pub event_capacity: usize,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            background_caching: true,
            event_capacity: 64,
        }
    }
}

impl StashConfig {
    pub fn builder() -> crate::builder::StashConfigBuilder {
        crate::builder::StashConfigBuilder::new()
    }

    /// Resolved cache directory, falling back to the system temp dir
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("stash-cache"))
    }
}

/// HTTP transport options used by the connection tasks
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Overall timeout for a request, zero leaves the transport default
    pub timeout: Duration,

    /// Connection timeout, zero leaves the transport default
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Hosts for which self-signed certificates are accepted
    pub self_signed_hosts: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: NetworkConfig::get_default_headers(),
            self_signed_hosts: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/png,image/*;q=0.8,*/*;q=0.5"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers
    }

    /// Whether `host` is allowed to present a self-signed certificate
    pub fn allows_self_signed(&self, host: &str) -> bool {
        self.self_signed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }
}

/// Worker pool bounds per network classification
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poor_concurrency: usize,
    pub average_concurrency: usize,
    pub optimal_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poor_concurrency: 1,
            average_concurrency: 3,
            optimal_concurrency: 6,
        }
    }
}

impl SchedulerConfig {
    /// Number of concurrent connection tasks allowed under `classification`.
    /// Never returns zero so the pool cannot stall.
    pub fn concurrency_for(&self, classification: NetworkClassification) -> usize {
        let limit = match classification {
            NetworkClassification::Poor => self.poor_concurrency,
            NetworkClassification::Average => self.average_concurrency,
            NetworkClassification::Optimal => self.optimal_concurrency,
        };
        limit.max(1)
    }
}

/// Rolling throughput window and classification thresholds
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Number of samples retained in the rolling window
    pub rolling_size: usize,

    /// Below this many bytes/second the network is poor
    pub poor_threshold: f64,

    /// At or above this many bytes/second the network is optimal
    pub optimal_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rolling_size: 10,
            poor_threshold: 50.0 * 1024.0,
            optimal_threshold: 500.0 * 1024.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_ordered_by_classification() {
        let config = SchedulerConfig::default();
        let poor = config.concurrency_for(NetworkClassification::Poor);
        let average = config.concurrency_for(NetworkClassification::Average);
        let optimal = config.concurrency_for(NetworkClassification::Optimal);
        assert!(poor < average);
        assert!(average < optimal);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let config = SchedulerConfig {
            poor_concurrency: 0,
            average_concurrency: 0,
            optimal_concurrency: 0,
        };
        assert_eq!(config.concurrency_for(NetworkClassification::Poor), 1);
    }

    #[test]
    fn test_self_signed_allowlist_ignores_case() {
        let config = NetworkConfig {
            self_signed_hosts: vec!["Images.Internal".to_string()],
            ..Default::default()
        };
        assert!(config.allows_self_signed("images.internal"));
        assert!(!config.allows_self_signed("example.com"));
    }
}
