//! # Connection Task
//!
//! One cancellable fetch of one URL. A task reports exactly one terminal
//! outcome: succeeded, failed, or cancelled. Cancelled tasks discard whatever
//! they had received and report nothing else.
//!
//! The actual transfer goes through the [`AssetFetcher`] seam so the
//! scheduler can be driven by something other than HTTP in tests.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::cache::AssetKey;
use crate::client::create_client;
use crate::config::NetworkConfig;
use crate::error::AssetError;

// Upper bound on preallocation from an untrusted Content-Length.
const MAX_PREALLOCATE: usize = 8 * 1024 * 1024;

/// A successful transfer
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub status: u16,
    pub body: Bytes,
}

/// Performs the transfer for a single asset.
///
/// `request` is a caller-built request for `key` (custom method, headers or
/// body). When absent the fetcher issues a plain GET for the URL.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(
        &self,
        key: &AssetKey,
        request: Option<reqwest::Request>,
    ) -> Result<FetchedAsset, AssetError>;
}

/// [`AssetFetcher`] over a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self, AssetError> {
        Ok(Self::new(create_client(config)?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Execute a caller-built request, accumulating the whole body.
    pub async fn execute(&self, request: reqwest::Request) -> Result<FetchedAsset, AssetError> {
        let host = request.url().host_str().unwrap_or_default().to_string();

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| AssetError::from_transport(&e, &host))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::HttpStatus(status));
        }

        let capacity = response
            .content_length()
            .map(|len| (len as usize).min(MAX_PREALLOCATE))
            .unwrap_or(0);
        let mut body = BytesMut::with_capacity(capacity);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AssetError::from_transport(&e, &host))?;
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedAsset {
            status: status.as_u16(),
            body: body.freeze(),
        })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(
        &self,
        key: &AssetKey,
        request: Option<reqwest::Request>,
    ) -> Result<FetchedAsset, AssetError> {
        if let Some(request) = request {
            return self.execute(request).await;
        }
        let url = Url::parse(key.as_str())
            .map_err(|e| AssetError::InvalidUrl(format!("{key}: {e}")))?;
        let request = self
            .client
            .get(url)
            .build()
            .map_err(|e| AssetError::Client(e.to_string()))?;
        self.execute(request).await
    }
}

/// Process-wide count of connection tasks in progress.
///
/// Hosts subscribe to drive a busy indicator. The count goes up when a task
/// starts and down on every terminal outcome, so it reads zero whenever no
/// task is outstanding.
#[derive(Debug, Clone)]
pub struct NetworkActivity {
    tx: Arc<watch::Sender<usize>>,
}

impl NetworkActivity {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Mark one task as started. The returned guard marks it finished on drop.
    pub fn begin(&self) -> ActivityGuard {
        self.tx.send_modify(|count| *count += 1);
        ActivityGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn in_progress(&self) -> usize {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }
}

impl Default for NetworkActivity {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ActivityGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.tx
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Produced exactly once per task that was not cancelled
#[derive(Debug, Clone)]
pub struct ConnectionTaskResult {
    pub key: AssetKey,
    pub bytes: Option<Bytes>,
    /// Status of the response, if one arrived
    pub http_status: Option<u16>,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub succeeded: bool,
}

/// Terminal outcome of a [`ConnectionTask`]
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded(ConnectionTaskResult),
    Failed(ConnectionTaskResult, AssetError),
    Cancelled(AssetKey),
}

impl TaskOutcome {
    pub fn key(&self) -> &AssetKey {
        match self {
            TaskOutcome::Succeeded(result) | TaskOutcome::Failed(result, _) => &result.key,
            TaskOutcome::Cancelled(key) => key,
        }
    }
}

/// A single cancellable fetch
pub struct ConnectionTask {
    key: AssetKey,
    request: Option<reqwest::Request>,
    fetcher: Arc<dyn AssetFetcher>,
    cancel: CancellationToken,
    activity: NetworkActivity,
}

impl ConnectionTask {
    pub fn new(
        key: AssetKey,
        fetcher: Arc<dyn AssetFetcher>,
        cancel: CancellationToken,
        activity: NetworkActivity,
    ) -> Self {
        Self {
            key,
            request: None,
            fetcher,
            cancel,
            activity,
        }
    }

    /// Send `request` instead of a plain GET for the key
    pub fn with_request(mut self, request: Option<reqwest::Request>) -> Self {
        self.request = request;
        self
    }

    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    pub async fn run(mut self) -> TaskOutcome {
        let _activity = self.activity.begin();
        let request = self.request.take();
        let started_at = SystemTime::now();
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.fetcher.fetch(&self.key, request) => Some(result),
        };

        let Some(result) = result else {
            debug!(url = %self.key, "Connection task cancelled");
            return TaskOutcome::Cancelled(self.key);
        };
        let duration = start.elapsed();

        match result {
            Ok(fetched) => {
                debug!(
                    url = %self.key,
                    status = fetched.status,
                    size = fetched.body.len(),
                    duration_ms = duration.as_millis() as u64,
                    "Connection task succeeded"
                );
                TaskOutcome::Succeeded(ConnectionTaskResult {
                    key: self.key,
                    bytes: Some(fetched.body),
                    http_status: Some(fetched.status),
                    started_at,
                    duration,
                    succeeded: true,
                })
            }
            Err(e) => {
                if e.is_tls() {
                    warn!(url = %self.key, error = %e, "Certificate rejected, host is not on the self-signed allowlist");
                } else {
                    warn!(url = %self.key, error = %e, "Connection task failed");
                }
                let http_status = match &e {
                    AssetError::HttpStatus(status) => Some(status.as_u16()),
                    _ => None,
                };
                TaskOutcome::Failed(
                    ConnectionTaskResult {
                        key: self.key,
                        bytes: None,
                        http_status,
                        started_at,
                        duration,
                        succeeded: false,
                    },
                    e,
                )
            }
        }
    }
}
