//! # Stash
//!
//! A URL-keyed asset cache. Ask for a URL and get its bytes back, fetched and
//! persisted on first use, served locally afterwards.
//!
//! ## Features
//!
//! - Two cache tiers: pressure-aware memory over durable files
//! - Single-flight downloads: concurrent requests for a URL share one fetch
//! - Download concurrency adapted to measured throughput
//! - Separate on-demand and background prefetch lanes
//! - Per-host allowlist for self-signed certificates

pub mod builder;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod scheduler;

#[cfg(test)]
mod test_utils;

pub use builder::StashConfigBuilder;
pub use cache::{AssetKey, AssetLease, CacheConfig, TieredCacheStore};
pub use client::create_client;
pub use config::{MonitorConfig, NetworkConfig, SchedulerConfig, StashConfig};
pub use connection::{AssetFetcher, FetchedAsset, HttpFetcher, NetworkActivity};
pub use error::AssetError;
pub use manager::{AssetManager, MemoryPressure};
pub use monitor::{NetworkClassification, NetworkSpeedMonitor};
pub use scheduler::{AssetEvent, CacheCounters};
