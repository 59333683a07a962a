//! # Network Speed Monitor
//!
//! Keeps a bounded rolling window of completed download samples and classifies
//! the recent average throughput as poor, average or optimal. The scheduler
//! reads the classification each time it is about to start a connection task.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::MonitorConfig;

/// Coarse network quality, ordered `Poor < Average < Optimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClassification {
    Poor,
    #[default]
    Average,
    Optimal,
}

impl fmt::Display for NetworkClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkClassification::Poor => "poor",
            NetworkClassification::Average => "average",
            NetworkClassification::Optimal => "optimal",
        };
        f.write_str(s)
    }
}

/// One completed transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    pub bytes: u64,
    pub duration: Duration,
}

impl NetworkSample {
    /// Throughput in bytes per second. Zero-length durations count as one
    /// microsecond so a cached or instantaneous response cannot divide by zero.
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64().max(1e-6);
        self.bytes as f64 / secs
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    window: VecDeque<NetworkSample>,
    classification: NetworkClassification,
    last_sampled_speed: f64,
    total_bytes: u64,
    total_samples: u64,
}

/// Rolling throughput estimator
#[derive(Debug)]
pub struct NetworkSpeedMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl NetworkSpeedMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Append a sample, dropping the oldest once the window is full, and
    /// recompute the classification.
    pub fn record_sample(&self, bytes: u64, duration: Duration) {
        let sample = NetworkSample { bytes, duration };
        let capacity = self.config.rolling_size.max(1);

        let mut state = self.state.lock();
        while state.window.len() >= capacity {
            state.window.pop_front();
        }
        state.window.push_back(sample);
        state.total_bytes = state.total_bytes.saturating_add(bytes);
        state.total_samples += 1;
        state.last_sampled_speed = sample.bytes_per_second();

        let average = Self::window_average(&state.window);
        let classification = self.classify(average);
        if classification != state.classification {
            debug!(
                from = %state.classification,
                to = %classification,
                bytes_per_second = average,
                "Network classification changed"
            );
        }
        state.classification = classification;
    }

    pub fn current_classification(&self) -> NetworkClassification {
        self.state.lock().classification
    }

    /// Throughput of the most recent sample, in bytes per second
    pub fn last_sampled_speed(&self) -> f64 {
        self.state.lock().last_sampled_speed
    }

    /// Average throughput over the current window, zero when empty
    pub fn average_speed(&self) -> f64 {
        Self::window_average(&self.state.lock().window)
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().window.len()
    }

    /// Total bytes and number of samples recorded since startup
    pub fn totals(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.total_bytes, state.total_samples)
    }

    fn classify(&self, bytes_per_second: f64) -> NetworkClassification {
        if bytes_per_second < self.config.poor_threshold {
            NetworkClassification::Poor
        } else if bytes_per_second >= self.config.optimal_threshold {
            NetworkClassification::Optimal
        } else {
            NetworkClassification::Average
        }
    }

    // Aggregate throughput: total bytes over total time, so one tiny fast
    // response does not outweigh a long transfer.
    fn window_average(window: &VecDeque<NetworkSample>) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        let bytes: u64 = window.iter().map(|s| s.bytes).sum();
        let secs: f64 = window.iter().map(|s| s.duration.as_secs_f64()).sum();
        bytes as f64 / secs.max(1e-6)
    }
}

impl Default for NetworkSpeedMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
