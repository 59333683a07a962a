//! Self-signed HTTPS endpoint for exercising the certificate allowlist.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

/// Certificate for `127.0.0.1`, signed by its own key
pub fn self_signed_cert() -> CertificateDer<'static> {
    CertificateDer::from(include_bytes!("../tests/data/self_signed.crt.der").to_vec())
}

fn self_signed_key() -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        include_bytes!("../tests/data/self_signed.key.der").to_vec(),
    ))
}

/// Answer a single HTTPS request on 127.0.0.1 with `body`, from a background
/// thread. Returns the address to connect to.
pub fn serve_tls_once(body: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(
        ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![self_signed_cert()], self_signed_key())
            .unwrap(),
    );

    std::thread::spawn(move || {
        let Ok((socket, _)) = listener.accept() else {
            return;
        };
        let Ok(conn) = ServerConnection::new(config) else {
            return;
        };
        let mut tls = StreamOwned::new(conn, socket);

        // A client that rejects the certificate aborts inside the first read.
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match tls.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = tls.write_all(head.as_bytes());
        let _ = tls.write_all(body);
        tls.conn.send_close_notify();
        let _ = tls.flush();
    });

    addr
}
