//! TLS termination for the control API.
//!
//! Loads the PEM certificate chain and private key from the deployment's SSL
//! root, builds a rustls `ServerConfig`, and serves the router over a manual
//! accept loop so WebSocket upgrades keep working behind TLS.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// How long a client may take to complete the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when loading TLS configuration.
#[derive(Debug)]
pub enum TlsError {
    /// Failed to read the certificate file.
    CertRead(PathBuf, std::io::Error),
    /// Failed to read the private key file.
    KeyRead(PathBuf, std::io::Error),
    /// No certificates found in the PEM file.
    NoCerts(PathBuf),
    /// No private key found in the PEM file.
    NoKey(PathBuf),
    /// Failed to build the TLS server configuration.
    Config(tokio_rustls::rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CertRead(path, e) => {
                write!(f, "failed to read TLS certificate {}: {}", path.display(), e)
            }
            Self::KeyRead(path, e) => write!(f, "failed to read TLS key {}: {}", path.display(), e),
            Self::NoCerts(path) => write!(f, "no certificates found in {}", path.display()),
            Self::NoKey(path) => write!(f, "no private key found in {}", path.display()),
            Self::Config(e) => write!(f, "failed to build TLS config: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}

/// Certificate and key locations inside an SSL root directory.
pub fn ssl_root_paths(ssl_root: &Path) -> (PathBuf, PathBuf) {
    (
        ssl_root.join("server-cert.pem"),
        ssl_root.join("server-key.pem"),
    )
}

/// Load TLS certificate chain and private key from PEM files, returning a
/// `TlsAcceptor` ready for use with `tokio_rustls`.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_data =
        std::fs::read(cert_path).map_err(|e| TlsError::CertRead(cert_path.to_path_buf(), e))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertRead(cert_path.to_path_buf(), e))?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts(cert_path.to_path_buf()));
    }

    // PKCS8, RSA and SEC1 keys are all accepted.
    let key_data =
        std::fs::read(key_path).map_err(|e| TlsError::KeyRead(key_path.to_path_buf(), e))?;
    let key = rustls_pemfile::private_key(&mut &key_data[..])
        .map_err(|e| TlsError::KeyRead(key_path.to_path_buf(), e))?
        .ok_or_else(|| TlsError::NoKey(key_path.to_path_buf()))?;

    // Idempotent if a provider is already installed.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsError::Config)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept TLS connections on `listener` and serve `app` on each until
/// `shutdown` fires. Connections already being served are left to finish.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("TLS server received cancel signal, stopping accept loop");
                break;
            }
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(?e, "failed to accept TCP connection");
                    // Backoff to prevent tight loop under sustained accept errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let tls_stream =
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        tracing::debug!(%peer, ?e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        tracing::debug!(%peer, "TLS handshake timed out");
                        return;
                    }
                };
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await
            {
                tracing::debug!(%peer, error = %e, "TLS connection ended with error");
            }
        });
    }
}
