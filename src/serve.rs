//! Listener plumbing shared by the catalog API and the per-database proxies.
//!
//! Serves an axum router on an accepted TCP (optionally TLS-wrapped) stream,
//! one task per connection. Shutdown stops the accept loop, signals every
//! in-flight connection to finish its current exchanges and waits for all of
//! them; there is no deadline.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

/// Load a rustls server configuration from PEM certificate and key files.
pub fn load_tls_config(cert_file: &Path, key_file: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(cert_file)
            .with_context(|| format!("failed to open {}", cert_file.display()))?,
    ))
    .collect::<std::io::Result<Vec<_>>>()
    .with_context(|| format!("failed to parse certificates in {}", cert_file.display()))?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        std::fs::File::open(key_file)
            .with_context(|| format!("failed to open {}", key_file.display()))?,
    ))
    .with_context(|| format!("failed to parse {}", key_file.display()))?
    .with_context(|| format!("no private key found in {}", key_file.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accept connections and serve `app` until `shutdown` fires, then drain all
/// in-flight connections.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    connections.spawn(handle_connection(
                        stream,
                        tls.clone(),
                        app.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    // Avoid a tight loop on persistent accept errors.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    app: Router,
    shutdown: watch::Receiver<bool>,
) {
    let service = TowerToHyperService::new(app);
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve_connection(TokioIo::new(tls_stream), service, shutdown).await,
            Err(e) => debug!(error = %e, "TLS handshake failed"),
        },
        None => serve_connection(TokioIo::new(stream), service, shutdown).await,
    }
}

async fn serve_connection<I>(
    io: I,
    service: TowerToHyperService<Router>,
    mut shutdown: watch::Receiver<bool>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, service);
    let mut conn = std::pin::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "connection error");
            }
        }
        _ = shutdown.changed() => {
            // Let in-flight exchanges complete, refuse new ones.
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!(error = %e, "connection error during shutdown");
            }
        }
    }
}
