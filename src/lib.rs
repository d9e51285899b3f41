//! TM1 v12 admin host.
//!
//! Legacy clients expect one dedicated process per database on a
//! host-assigned port, discovered through a small OData catalog. The
//! backend is now a multi-tenant service addressed by name on a single URL;
//! this service bridges the two worlds:
//!
//! - discovers live databases from the upstream catalog
//! - allocates each one a stable port from a bounded pool (persisted in
//!   `servers.json`)
//! - runs a rewriting reverse proxy on every such port
//! - serves the `name -> host:port` mapping as an OData `Servers` collection

pub mod api;
pub mod config;
pub mod fleet;
pub mod ports;
pub mod proxy;
pub mod serve;
pub mod upstream;

pub use config::{Config, ConfigFile};
pub use fleet::Fleet;
