//! HTTP client construction.
//!
//! Certificates are validated against the bundled web PKI roots. Hosts listed
//! in [`NetworkConfig::self_signed_hosts`] may present a certificate that
//! fails chain validation; handshake signatures are still checked for them.

use std::sync::Arc;

use reqwest::Client;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::error::AssetError;

/// Create a reqwest Client with the provided network configuration
pub fn create_client(config: &NetworkConfig) -> Result<Client, AssetError> {
    let provider = Arc::new(ring::default_provider());
    let verifier = AllowlistVerifier::new(config, Arc::clone(&provider))?;

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AssetError::Client(format!("Failed to configure TLS protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.self_signed_hosts.is_empty() {
        debug!(hosts = ?config.self_signed_hosts, "Accepting self-signed certificates for allowlisted hosts");
    }

    client_builder
        .build()
        .map_err(|e| AssetError::Client(e.to_string()))
}

/// Web PKI verification with a per-host escape hatch for self-signed
/// certificates.
#[derive(Debug)]
struct AllowlistVerifier {
    inner: Arc<WebPkiServerVerifier>,
    network: NetworkConfig,
}

impl AllowlistVerifier {
    fn new(network: &NetworkConfig, provider: Arc<CryptoProvider>) -> Result<Self, AssetError> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| AssetError::Client(format!("Failed to build certificate verifier: {e}")))?;
        Ok(Self {
            inner,
            network: network.clone(),
        })
    }

    fn is_allowed(&self, server_name: &ServerName<'_>) -> bool {
        self.network.allows_self_signed(&server_name.to_str())
    }
}

impl ServerCertVerifier for AllowlistVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(reason)) if self.is_allowed(server_name) => {
                warn!(
                    host = %server_name.to_str(),
                    reason = ?reason,
                    "Accepting untrusted certificate for allowlisted host"
                );
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
