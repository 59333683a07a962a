use futures::future::join_all;
use serde::Serialize;
use stash_engine::cache::TierStats;
use stash_engine::{AssetEvent, AssetManager, CacheCounters};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::error::AppError;
use crate::utils::format_bytes;

pub async fn fetch(manager: &AssetManager, urls: &[String]) -> Result<(), AppError> {
    let results = join_all(urls.iter().map(|url| async move {
        (url, manager.fetch_async(url.as_str()).await)
    }))
    .await;

    let mut failed = 0;
    for (url, data) in results {
        match data {
            Some(bytes) => {
                let path = manager.local_path_for(url.as_str());
                println!("{}\t{}\t{}", url, format_bytes(bytes.len() as u64), path.display());
            }
            None => {
                warn!(url = %url, "Asset could not be fetched");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(AppError::FetchFailed(failed));
    }
    Ok(())
}

pub async fn prefetch(manager: &AssetManager, urls: &[String]) -> Result<(), AppError> {
    let mut events = manager.subscribe();
    let queued = manager.queue_all(urls.iter().map(String::as_str)).await;
    info!(queued, already_cached = urls.len() - queued, "Prefetch queued");

    let mut completed = 0;
    let mut failed = 0;
    while manager.counters().remaining_queued_items > 0 {
        match events.recv().await {
            Ok(AssetEvent::DownloadComplete { url, data }) => {
                if data.is_some() {
                    completed += 1;
                } else {
                    warn!(url = %url, "Prefetch failed");
                    failed += 1;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed download events");
            }
            Err(RecvError::Closed) => break,
        }
    }

    info!(completed, failed, "Prefetch finished");
    if failed > 0 {
        return Err(AppError::FetchFailed(failed));
    }
    Ok(())
}

pub fn paths(manager: &AssetManager, urls: &[String]) {
    for url in urls {
        println!("{}\t{}", url, manager.local_path_for(url.as_str()).display());
    }
}

#[derive(Debug, Serialize)]
struct StatsReport {
    counters: CacheCounters,
    tiers: TierStats,
    network: NetworkReport,
}

/// Throughput figures since the process started
#[derive(Debug, Serialize)]
struct NetworkReport {
    window_samples: usize,
    window_average_speed: f64,
    total_bytes: u64,
    total_samples: u64,
}

pub fn stats(manager: &AssetManager) -> Result<(), AppError> {
    let monitor = manager.monitor();
    let (total_bytes, total_samples) = monitor.totals();
    let report = StatsReport {
        counters: manager.counters(),
        tiers: manager.stats(),
        network: NetworkReport {
            window_samples: monitor.sample_count(),
            window_average_speed: monitor.average_speed(),
            total_bytes,
            total_samples,
        },
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn flush(manager: &AssetManager) -> Result<(), AppError> {
    let flushed = manager.flush_cache().await?;
    println!("Flushed {flushed} cached asset(s)");
    Ok(())
}

pub async fn clear_index(manager: &AssetManager, confirmed: bool) -> Result<(), AppError> {
    if !confirmed {
        return Err(AppError::InvalidInput(
            "clearing the index orphans every cached file; pass --yes to confirm".to_string(),
        ));
    }
    let removed = manager.clear_persistent_cache_list().await?;
    println!("Removed {removed} index record(s)");
    Ok(())
}
