//! Proxy fleet management.
//!
//! The fleet manager reconciles the databases observed upstream with the
//! proxies currently running: servers whose database disappeared (or lost
//! all replicas) are stopped and removed, new databases get a server with a
//! port from the allocator and a running proxy, existing servers have their
//! observable fields refreshed. `refresh` is the only mutator of the active
//! maps; a single lock covers the active maps and the allocator together.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use crate::api::odata::ServerEntity;
use crate::config::Config;
use crate::ports::{PortMap, PortMapWatch, PortRange};
use crate::proxy::{self, ProxyInstance};
use crate::serve;
use crate::upstream::{CatalogClient, Database};

/// How often the port-map file is polled for external edits.
pub const PORT_MAP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A server and its running proxy, if any. `proxy` is `Some` exactly when
/// the entity has a nonzero port.
struct ServerRecord {
    entity: ServerEntity,
    proxy: Option<ProxyInstance>,
}

/// Everything the fleet lock protects: both active maps plus the allocator
/// state. Kept in one owning struct so no mutation can bypass the lock.
struct FleetState {
    servers: BTreeMap<String, ServerRecord>,
    active_ports: BTreeMap<u16, String>,
    ports: PortMap,
}

struct FleetInner {
    config: Arc<Config>,
    catalog: CatalogClient,
    forward_client: reqwest::Client,
    proxy_tls: Option<Arc<rustls::ServerConfig>>,
    state: Mutex<FleetState>,
}

/// Handle to the shared fleet. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl Fleet {
    /// Set up the fleet: build the upstream clients, load the per-database
    /// TLS material when proxies terminate TLS, and initialize the port map
    /// from `port_map_path`.
    pub fn new(config: Arc<Config>, port_map_path: PathBuf) -> Result<Self> {
        let catalog = CatalogClient::new(&config)?;
        let forward_client = proxy::forward_client()?;

        let proxy_tls = if config.using_ssl {
            Some(
                serve::load_tls_config(&config.servers_cert_file, &config.servers_key_file)
                    .context("failed to load the per-database proxy TLS material")?,
            )
        } else {
            None
        };

        let mut ports = PortMap::new(port_map_path);
        if let Err(e) = ports.init() {
            // The in-memory map stays authoritative.
            error!(error = %e, "failed to initialize the port map");
        }

        Ok(Self {
            inner: Arc::new(FleetInner {
                config,
                catalog,
                forward_client,
                proxy_tls,
                state: Mutex::new(FleetState {
                    servers: BTreeMap::new(),
                    active_ports: BTreeMap::new(),
                    ports,
                }),
            }),
        })
    }

    /// Reconcile the fleet against the upstream catalog.
    ///
    /// On a fetch error the state is left untouched. Removals happen before
    /// upserts; the port map is persisted afterwards on a background task so
    /// reconcile latency stays bounded.
    pub async fn refresh(&self) -> Result<()> {
        let databases = self.inner.catalog.list_databases().await?;

        let mut stopped: Vec<ProxyInstance> = Vec::new();
        {
            let mut state = self.inner.state.lock().await;

            let stale: Vec<String> = state
                .servers
                .keys()
                .filter(|name| {
                    !databases
                        .iter()
                        .any(|db| db.name == **name && db.replica_count > 0)
                })
                .cloned()
                .collect();
            for name in stale {
                if let Some(proxy) = remove_server(&mut state, &name) {
                    // Stop accepting right away; the drain happens below,
                    // off the reconcile path.
                    proxy.begin_shutdown();
                    stopped.push(proxy);
                }
            }

            for database in databases.iter().filter(|db| db.replica_count > 0) {
                self.upsert(&mut state, database).await;
            }
        }

        // Drain the stopped proxies concurrently, without holding the fleet
        // lock; their deadline is unbounded and must not stall readers.
        if !stopped.is_empty() {
            tokio::spawn(async move {
                let mut shutdowns = JoinSet::new();
                for proxy in stopped {
                    shutdowns.spawn(proxy.shutdown());
                }
                while shutdowns.join_next().await.is_some() {}
            });
        }

        let fleet = self.clone();
        tokio::spawn(async move { fleet.persist_ports().await });
        Ok(())
    }

    /// Create or update the server for one observed database.
    async fn upsert(&self, state: &mut FleetState, database: &Database) {
        let config = &self.inner.config;
        let accepts = database.accepts_clients();
        let range = PortRange {
            min: config.port_min,
            max: config.port_max,
        };

        if !state.servers.contains_key(&database.name) {
            let port = {
                let FleetState {
                    ports,
                    active_ports,
                    ..
                } = state;
                ports.assign(&database.name, range, active_ports)
            };

            let mut entity = ServerEntity::new(
                &database.name,
                config.host_name.clone(),
                config.ipv4_address.clone(),
                config.ipv6_address.clone(),
                config.using_ssl,
            );
            entity.http_port_number = port;
            entity.accepting_clients = port != 0 && accepts;
            entity.last_updated = now_rfc3339();

            let proxy = if port != 0 {
                let proxy = self.start_proxy(&database.name, port).await;
                if proxy.is_none() {
                    // The map entry stays; the next reconcile retries.
                    entity.http_port_number = 0;
                    entity.accepting_clients = false;
                }
                proxy
            } else {
                error!(
                    server = %database.name,
                    "no more ports available, please consider increasing the port range"
                );
                None
            };

            if entity.http_port_number != 0 {
                state
                    .active_ports
                    .insert(entity.http_port_number, database.name.clone());
            }
            state
                .servers
                .insert(database.name.clone(), ServerRecord { entity, proxy });
            return;
        }

        // Existing server: if it is still without a port, try again now that
        // the pool may have room; otherwise refresh the drifted fields.
        let needs_port = state
            .servers
            .get(&database.name)
            .is_some_and(|record| record.entity.http_port_number == 0);

        let mut recovered: Option<(u16, ProxyInstance)> = None;
        if needs_port {
            let port = {
                let FleetState {
                    ports,
                    active_ports,
                    ..
                } = state;
                ports.assign(&database.name, range, active_ports)
            };
            if port != 0 {
                if let Some(proxy) = self.start_proxy(&database.name, port).await {
                    info!(
                        server = %database.name,
                        port,
                        "a port has become available, assigning it to the server"
                    );
                    recovered = Some((port, proxy));
                }
            }
        }

        let Some(record) = state.servers.get_mut(&database.name) else {
            return;
        };

        let mut updated = false;
        let mut claimed_port = 0;
        if let Some((port, proxy)) = recovered {
            record.entity.http_port_number = port;
            record.entity.accepting_clients = accepts;
            record.proxy = Some(proxy);
            claimed_port = port;
            updated = true;
        }
        if !updated && record.entity.accepting_clients != accepts {
            record.entity.accepting_clients = accepts;
            updated = true;
        }
        if record.entity.host != config.host_name {
            record.entity.host = config.host_name.clone();
            updated = true;
        }
        if record.entity.ip_address != config.ipv4_address {
            record.entity.ip_address = config.ipv4_address.clone();
            updated = true;
        }
        if record.entity.ipv6_address != config.ipv6_address {
            record.entity.ipv6_address = config.ipv6_address.clone();
            updated = true;
        }
        if !updated {
            return;
        }
        record.entity.last_updated = now_rfc3339();

        if claimed_port != 0 {
            state
                .active_ports
                .insert(claimed_port, database.name.clone());
        }
    }

    /// Start the proxy for a server with an assigned port. A bind failure
    /// is logged and reported as `None`; the caller leaves the server
    /// without a port and the next reconcile retries.
    async fn start_proxy(&self, name: &str, port: u16) -> Option<ProxyInstance> {
        match ProxyInstance::start(
            name,
            port,
            &self.inner.config.database_url_template,
            self.inner.forward_client.clone(),
            self.inner.proxy_tls.clone(),
        )
        .await
        {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                error!(server = %name, port, error = %e, "proxy failed to start");
                None
            }
        }
    }

    /// Current entity list, refreshed first. Refresh failures are logged and
    /// the last known state is served.
    pub async fn list_servers(&self) -> Vec<ServerEntity> {
        if let Err(e) = self.refresh().await {
            error!(error = %e, "unable to refresh servers list");
        }

        let state = self.inner.state.lock().await;
        state
            .servers
            .values()
            .map(|record| record.entity.clone())
            .collect()
    }

    /// A single entity by name, refreshed first.
    pub async fn lookup_server(&self, name: &str) -> Option<ServerEntity> {
        if let Err(e) = self.refresh().await {
            error!(error = %e, "unable to refresh servers list");
        }

        let state = self.inner.state.lock().await;
        state
            .servers
            .get(name)
            .map(|record| record.entity.clone())
    }

    /// Flush the port map if it changed. Runs on a background task after
    /// each reconcile; the lock is held only for the snapshot and write.
    pub async fn persist_ports(&self) {
        let mut state = self.inner.state.lock().await;
        if let Err(e) = state.ports.persist() {
            error!(error = %e, "failed to persist the port map");
        }
    }

    /// Watch the port-map file for external edits and reload it, skipping
    /// changes caused by our own `persist`.
    pub fn spawn_port_map_watcher(&self, poll_interval: Duration) -> JoinHandle<()> {
        let fleet = self.clone();
        tokio::spawn(async move {
            let path = {
                let state = fleet.inner.state.lock().await;
                state.ports.path().to_path_buf()
            };
            let mut watch = PortMapWatch::new(path);
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !watch.changed() {
                    continue;
                }

                let mut state = fleet.inner.state.lock().await;
                if state.ports.take_ignore_flag() {
                    continue;
                }
                match state.ports.load_from_file() {
                    Ok(()) => info!("servers port map reloaded"),
                    Err(e) => error!(error = %e, "failed to reload the port map"),
                }
            }
        })
    }

    /// Gracefully stop every proxy and clear the active maps. Shutdowns run
    /// concurrently; the call returns when all proxies have drained.
    pub async fn shutdown_all(&self) {
        let mut state = self.inner.state.lock().await;
        let servers = std::mem::take(&mut state.servers);
        state.active_ports.clear();

        let mut tasks = JoinSet::new();
        for (_, record) in servers {
            if let Some(proxy) = record.proxy {
                tasks.spawn(proxy.shutdown());
            }
        }
        while tasks.join_next().await.is_some() {}
    }
}

/// Drop a server from both active maps and hand its proxy, if any, back to
/// the caller for a concurrent shutdown. The port-map entry is kept so the
/// database gets the same port back later.
fn remove_server(state: &mut FleetState, name: &str) -> Option<ProxyInstance> {
    let record = state.servers.remove(name)?;

    if record.entity.http_port_number != 0 {
        state.active_ports.remove(&record.entity.http_port_number);
    }
    record.proxy
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
