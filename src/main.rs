//! TM1 v12 admin host entry point.
//!
//! Startup: read the configuration, open the log sinks, initialize the port
//! allocator and its file watcher, kick off an initial fleet refresh, then
//! serve the catalog API over HTTP and/or HTTPS. Shutdown on SIGINT/SIGTERM
//! drains the catalog listeners and every per-database proxy.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tm1_admsrv::fleet::PORT_MAP_POLL_INTERVAL;
use tm1_admsrv::{api, config, serve, Config, ConfigFile, Fleet};

/// File in which the server-to-port map is persisted.
const PORT_MAP_FILE: &str = "./servers.json";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = ConfigFile::default_path();
    let (file, config_warning) = ConfigFile::read(&config_path);

    // Log sinks first, so configuration problems end up in the log: JSON
    // lines in the configured file plus a readable console layer.
    let (filter, level_warning) = config::level_filter(&file.log.level);
    let log_dir = file.log.file.parent().map(PathBuf::from).unwrap_or_default();
    let log_name = file
        .log
        .file
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tm1-v12-admsrv.log"));
    let (file_writer, _log_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, log_name));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.to_string().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(warning) = config_warning {
        warn!("{warning}");
    }
    if let Some(warning) = level_warning {
        warn!("{warning}");
    }

    info!("starting TM1 v12 admin service");

    let config = match Config::build(&file) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e.into());
        }
    };

    // The TLS stack is shared by the catalog listener and every proxy.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let fleet = Fleet::new(Arc::clone(&config), PathBuf::from(PORT_MAP_FILE))?;
    let _port_map_watcher = fleet.spawn_port_map_watcher(PORT_MAP_POLL_INTERVAL);

    // Kick off the reverse proxies for the databases already upstream.
    {
        let fleet = fleet.clone();
        tokio::spawn(async move {
            if let Err(e) = fleet.refresh().await {
                error!(error = %e, "unable to refresh servers list");
            }
        });
    }

    let app = api::router(fleet.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listeners = JoinSet::new();

    if config.https_port != 0 {
        let tls = serve::load_tls_config(&config.cert_file, &config.key_file)
            .context("failed to load the catalog API TLS material")?;
        let listener = TcpListener::bind(("0.0.0.0", config.https_port))
            .await
            .with_context(|| format!("failed to bind HTTPS port {}", config.https_port))?;
        info!(port = config.https_port, "starting HTTPS server");
        listeners.spawn(serve::serve_with_shutdown(
            listener,
            Some(TlsAcceptor::from(tls)),
            app.clone(),
            shutdown_rx.clone(),
        ));
    }

    if config.http_port != 0 {
        let listener = TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .with_context(|| format!("failed to bind HTTP port {}", config.http_port))?;
        info!(port = config.http_port, "starting HTTP server");
        listeners.spawn(serve::serve_with_shutdown(
            listener,
            None,
            app.clone(),
            shutdown_rx.clone(),
        ));
    }
    drop(shutdown_rx);

    shutdown_signal().await?;
    info!("shutdown signal received, shutting down servers");

    let _ = shutdown_tx.send(true);
    while listeners.join_next().await.is_some() {}
    fleet.shutdown_all().await;

    info!("all servers stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install the SIGTERM handler")?;
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }

    Ok(())
}
