//! Upstream transport
//! One HTTP/1.1 connection per forwarded request, TLS for https targets

use crate::error::ProxyError;
use crate::forward::Target;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Sends already translated requests to rule targets
///
/// The request URI is written to the wire untouched, so whatever path and
/// query the translation produced is exactly what the origin receives.
#[derive(Clone)]
pub struct UpstreamClient {
    tls: TlsConnector,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            tls: TlsConnector::from(Arc::new(build_tls_config())),
        }
    }

    /// Connect to `target` and send `req`, whose URI must be origin-form
    pub async fn send(&self, target: &Target, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, ProxyError> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| ProxyError::upstream(format!("failed to connect to {}", target.authority), &e))?;

        if !target.is_https() {
            return Self::exchange(stream, req).await;
        }

        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| ProxyError::Upstream(format!("invalid TLS server name '{}': {}", target.host, e)))?;

        let tls_stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::upstream(format!("TLS handshake with {} failed", target.authority), &e))?;

        Self::exchange(tls_stream, req).await
    }

    async fn exchange<S>(io: S, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| ProxyError::upstream("failed to establish upstream connection", &e))?;

        // Dropping the sender mid-request makes the connection task shut down
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection error: {}", e);
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(|e| ProxyError::upstream("upstream request failed", &e))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn build_tls_config() -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    // The connection is driven by an HTTP/1.1 handshake
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}
