//! Upstream database catalog client.
//!
//! The admin host discovers live databases by querying the v12 service's
//! `Databases` collection. One GET per refresh, carrying HTTP Basic
//! credentials; the response is an OData collection envelope.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::config::Config;

/// Projection applied to every catalog fetch.
const PROJECTION: &str =
    "$select=ID,Name,ProductVersion,ServiceRootURL,Replicas&$expand=ActiveReplicas($select=ID,State,Role)";

/// A database as observed upstream. Transient per refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ProductVersion", default)]
    pub product_version: Option<ProductVersion>,
    #[serde(rename = "ServiceRootURL", default)]
    pub service_root_url: String,
    #[serde(rename = "Replicas", default)]
    pub replica_count: i64,
    #[serde(rename = "ActiveReplicas", default)]
    pub active_replicas: Vec<Replica>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductVersion {
    #[serde(rename = "SemVer", default)]
    pub sem_ver: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Replica {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Role", default)]
    pub role: String,
}

impl Database {
    /// A database accepts clients iff any active replica is ready.
    pub fn accepts_clients(&self) -> bool {
        self.active_replicas.iter().any(|r| r.state == "ready")
    }
}

#[derive(Debug, Deserialize)]
struct DatabasesResponse {
    #[serde(rename = "value", default)]
    value: Vec<Database>,
}

/// Client for the upstream catalog.
pub struct CatalogClient {
    http: reqwest::Client,
    fetch_url: String,
    username: String,
    password: String,
}

impl CatalogClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tm1-admsrv/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build the catalog HTTP client")?;

        Ok(Self {
            http,
            fetch_url: fetch_url(
                &config.databases_url.resource,
                config.databases_url.query_and_fragment.as_deref(),
            ),
            username: config.basic_username.clone(),
            password: config.basic_password.clone(),
        })
    }

    /// Fetch the current list of upstream databases.
    ///
    /// Network failure, a non-2xx status and malformed JSON all surface as a
    /// single refresh error; the caller leaves its state untouched.
    pub async fn list_databases(&self) -> Result<Vec<Database>> {
        let resp = self
            .http
            .get(&self.fetch_url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .context("databases request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("databases request failed (status={status}): {body}"));
        }

        let body: DatabasesResponse = resp
            .json()
            .await
            .context("invalid databases response JSON")?;
        Ok(body.value)
    }
}

/// Build the effective fetch URL: the projection goes first, the configured
/// query is preserved after it, and a fragment, if present, stays last.
fn fetch_url(resource: &str, query_and_fragment: Option<&str>) -> String {
    let mut url = format!("{resource}?{PROJECTION}");
    if let Some(extra) = query_and_fragment {
        let mut parts = extra.splitn(2, '#');
        let query = parts.next().unwrap_or_default();
        let fragment = parts.next();
        if !query.is_empty() {
            url.push('&');
            url.push_str(query);
        }
        if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
            url.push('#');
            url.push_str(fragment);
        }
    }
    url
}
