use reqwest::StatusCode;
use std::error::Error as StdError;
use std::sync::Arc;

/// Errors produced inside the cache/download subsystem.
///
/// None of these reach the public completion contract: waiters only ever see
/// data or its absence. They surface through logs and at the `AssetFetcher`
/// and durable-tier seams.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AssetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned status code {0}")]
    HttpStatus(StatusCode),

    #[error("TLS validation failed for {host}: {reason}")]
    Tls { host: String, reason: String },

    #[error("Durable persistence failed: {source}")]
    Persistence {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl From<std::io::Error> for AssetError {
    fn from(err: std::io::Error) -> Self {
        AssetError::Persistence {
            source: Arc::new(err),
        }
    }
}

impl AssetError {
    /// Classify a transport error, separating certificate failures from plain
    /// connection failures.
    pub fn from_transport(err: &reqwest::Error, host: &str) -> Self {
        if let Some(reason) = find_tls_failure(err) {
            return AssetError::Tls {
                host: host.to_string(),
                reason,
            };
        }
        if let Some(status) = err.status() {
            return AssetError::HttpStatus(status);
        }
        AssetError::Network(err.to_string())
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, AssetError::Tls { .. })
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, AssetError::Persistence { .. })
    }
}

// rustls errors arrive wrapped in io::Error somewhere down the hyper chain.
fn find_tls_failure(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls.to_string());
        }
        // io::Error::source skips the error it wraps, so step into it here.
        current = match e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
        {
            Some(inner) => Some(inner as &(dyn StdError + 'static)),
            None => e.source(),
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_persistence() {
        let err: AssetError = std::io::Error::other("disk full").into();
        assert!(err.is_persistence());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_tls_failure_found_inside_io_error() {
        let io = std::io::Error::other(rustls::Error::InvalidCertificate(
            rustls::CertificateError::UnknownIssuer,
        ));
        let reason = find_tls_failure(&io).expect("tls failure in chain");
        assert!(reason.contains("UnknownIssuer") || reason.contains("issuer"));
    }

    #[test]
    fn test_tls_failure_found_through_nested_io_errors() {
        let inner = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        let outer = std::io::Error::other(inner);
        assert!(find_tls_failure(&outer).is_some());
    }

    #[test]
    fn test_plain_io_error_is_not_tls() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(find_tls_failure(&io).is_none());
    }
}
