//! Admin host configuration.
//!
//! Configuration is read from a JSON file (`config.json` in the working
//! directory, overridable via `TM1_ADMSRV_CONFIG`) and validated into an
//! immutable [`Config`]. A missing or unreadable file falls back to the
//! defaults with a warning; a configuration that fails validation is fatal.

use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

/// Default port range handed to the allocator when the configured one is invalid.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (9601, 9659);

/// Errors produced while validating the configuration. All of these abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid databases URL `{url}`: {reason}")]
    InvalidDatabasesUrl { url: String, reason: String },

    #[error("invalid database URL template `{template}`: {reason}")]
    InvalidUrlTemplate { template: String, reason: String },

    #[error("no HTTP nor HTTPS port specified; the admin service would not listen for requests")]
    NoListenerPorts,
}

/// Raw configuration file shape. Every section and field is optional; the
/// dotted option names map onto nested objects (`admsrv.http-port` is
/// `{"admsrv": {"http-port": ...}}`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConfigFile {
    pub admsrv: AdmsrvSection,
    pub tm1_v12: Tm1Section,
    pub servers: ServersSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AdmsrvSection {
    /// Catalog API plaintext port (0 disables the HTTP listener).
    pub http_port: u16,
    /// Catalog API TLS port (0 disables the HTTPS listener).
    pub https_port: u16,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for AdmsrvSection {
    fn default() -> Self {
        Self {
            http_port: 5895,
            https_port: 5898,
            cert_file: PathBuf::from("./cert.pem"),
            key_file: PathBuf::from("./key.pem"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Tm1Section {
    /// Upstream database catalog URL; must end in a `Databases` path segment.
    pub databases_url: String,
    /// Per-database upstream URL template; derived from `databases-url` when empty.
    pub database_url_template: String,
    pub auth: AuthSection,
}

impl Default for Tm1Section {
    fn default() -> Self {
        Self {
            databases_url: "http://localhost:4444/tm1/api/v1/Databases".to_string(),
            database_url_template: String::new(),
            auth: AuthSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthSection {
    pub basic: BasicAuthSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BasicAuthSection {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServersSection {
    /// `Host` field of every Server entity ("" serializes as null).
    pub host_name: String,
    pub ip_v4_address: String,
    pub ip_v6_address: String,
    pub port_range: PortRangeSection,
    /// Whether per-database proxies terminate TLS.
    pub using_ssl: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for ServersSection {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            ip_v4_address: String::new(),
            ip_v6_address: String::new(),
            port_range: PortRangeSection::default(),
            using_ssl: false,
            cert_file: PathBuf::from("./cert.pem"),
            key_file: PathBuf::from("./key.pem"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortRangeSection {
    pub min: i64,
    pub max: i64,
}

impl Default for PortRangeSection {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_RANGE.0 as i64,
            max: DEFAULT_PORT_RANGE.1 as i64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogSection {
    /// Log level: fatal, error, warning, info or debug.
    pub level: String,
    pub file: PathBuf,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: PathBuf::from("./tm1-v12-admsrv.log"),
        }
    }
}

impl ConfigFile {
    /// Read the configuration file, falling back to defaults when it is
    /// missing or unreadable. The returned warning, if any, is logged by the
    /// caller once the log sinks are open.
    pub fn read(path: &Path) -> (Self, Option<String>) {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return (
                    Self::default(),
                    Some(format!(
                        "config file {} not found, continuing with default configuration",
                        path.display()
                    )),
                );
            }
            Err(e) => {
                return (
                    Self::default(),
                    Some(format!(
                        "config file {} could not be read ({e}), continuing with default configuration",
                        path.display()
                    )),
                );
            }
        };

        match serde_json::from_str(&raw) {
            Ok(file) => (file, None),
            Err(e) => (
                Self::default(),
                Some(format!(
                    "config file {} could not be parsed ({e}), continuing with default configuration",
                    path.display()
                )),
            ),
        }
    }

    /// Path of the configuration file: `TM1_ADMSRV_CONFIG` or `./config.json`.
    pub fn default_path() -> PathBuf {
        std::env::var_os("TM1_ADMSRV_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./config.json"))
    }
}

/// Validated databases catalog URL, split the way requests are built from it:
/// the resource part (scheme, host, path) and everything after the first `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabasesUrl {
    /// `scheme://host/.../Databases`, no query.
    pub resource: String,
    /// Raw query (and trailing fragment) as configured, without the `?`.
    pub query_and_fragment: Option<String>,
}

impl DatabasesUrl {
    fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDatabasesUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = url.splitn(2, '?');
        let resource = parts.next().unwrap_or_default();
        let query_and_fragment = parts.next().map(str::to_string);
        if query_and_fragment
            .as_deref()
            .is_some_and(|q| q.contains('?'))
        {
            return Err(invalid("more than one query separator"));
        }

        let (proto, rest) = resource
            .split_once("://")
            .ok_or_else(|| invalid("protocol missing"))?;
        if proto != "http" && proto != "https" {
            return Err(invalid("protocol must be http or https"));
        }
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() < 2 || segments[0].is_empty() {
            return Err(invalid("host or path missing"));
        }
        if segments[segments.len() - 1] != "Databases" {
            return Err(invalid("path should end with a 'Databases' segment"));
        }

        Ok(Self {
            resource: resource.to_string(),
            query_and_fragment,
        })
    }
}

/// Per-database upstream URL template, normalized so the single substitution
/// variable is spelled `{{.database}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

const TEMPLATE_VAR: &str = "{{.database}}";

impl UrlTemplate {
    fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrlTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut vars = Vec::new();
        let mut rest = template;
        let mut offset = 0;
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let Some(len) = after.find("}}") else { break };
            vars.push((offset + start, offset + start + 2 + len + 2, &after[..len]));
            offset += start + 2 + len + 2;
            rest = &template[offset..];
        }

        let [(start, end, name)] = vars[..] else {
            return Err(invalid(
                "template should contain exactly one variable, as in `Databases('{{database}}')`",
            ));
        };
        if name != "database" && name != ".database" {
            return Err(invalid("the template variable must be named 'database'"));
        }

        let mut normalized = String::with_capacity(template.len() + 1);
        normalized.push_str(&template[..start]);
        normalized.push_str(TEMPLATE_VAR);
        normalized.push_str(&template[end..]);
        Ok(Self(normalized))
    }

    /// Derived default: the databases resource with the name appended in
    /// OData key syntax, re-appending any configured query.
    fn derived(url: &DatabasesUrl) -> Self {
        let mut template = format!("{}('{TEMPLATE_VAR}')", url.resource);
        if let Some(query) = &url.query_and_fragment {
            template.push('?');
            template.push_str(query);
        }
        Self(template)
    }

    /// Substitute the database name into the template.
    pub fn render(&self, database: &str) -> String {
        self.0.replace(TEMPLATE_VAR, database)
    }

    /// The normalized template text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validated, effective configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub https_port: u16,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    pub databases_url: DatabasesUrl,
    pub database_url_template: UrlTemplate,
    pub basic_username: String,
    pub basic_password: String,

    pub host_name: String,
    /// Effective IPv4 address, resolved from `host-name` when not configured.
    pub ipv4_address: Option<String>,
    /// Effective IPv6 address, resolved from `host-name` when not configured.
    pub ipv6_address: Option<String>,
    pub port_min: u16,
    pub port_max: u16,
    pub using_ssl: bool,
    pub servers_cert_file: PathBuf,
    pub servers_key_file: PathBuf,

    pub log_level: String,
    pub log_file: PathBuf,
}

impl Config {
    /// Validate the raw file into an effective configuration. Invalid URLs,
    /// templates and missing listener ports are fatal; an invalid port range
    /// is logged and replaced with the default range.
    pub fn build(file: &ConfigFile) -> Result<Self, ConfigError> {
        if file.admsrv.http_port == 0 && file.admsrv.https_port == 0 {
            return Err(ConfigError::NoListenerPorts);
        }

        let databases_url = DatabasesUrl::parse(&file.tm1_v12.databases_url)?;

        let database_url_template = if file.tm1_v12.database_url_template.is_empty() {
            UrlTemplate::derived(&databases_url)
        } else {
            UrlTemplate::parse(&file.tm1_v12.database_url_template)?
        };

        let (port_min, port_max) = validate_port_range(&file.servers.port_range);

        let (ipv4_address, ipv6_address) = resolve_addresses(
            &file.servers.host_name,
            &file.servers.ip_v4_address,
            &file.servers.ip_v6_address,
        );

        Ok(Self {
            http_port: file.admsrv.http_port,
            https_port: file.admsrv.https_port,
            cert_file: file.admsrv.cert_file.clone(),
            key_file: file.admsrv.key_file.clone(),
            databases_url,
            database_url_template,
            basic_username: file.tm1_v12.auth.basic.username.clone(),
            basic_password: file.tm1_v12.auth.basic.password.clone(),
            host_name: file.servers.host_name.clone(),
            ipv4_address,
            ipv6_address,
            port_min,
            port_max,
            using_ssl: file.servers.using_ssl,
            servers_cert_file: file.servers.cert_file.clone(),
            servers_key_file: file.servers.key_file.clone(),
            log_level: file.log.level.clone(),
            log_file: file.log.file.clone(),
        })
    }
}

fn validate_port_range(range: &PortRangeSection) -> (u16, u16) {
    if range.min <= 0 || range.max > 65535 || range.min > range.max {
        error!(
            min = range.min,
            max = range.max,
            "no valid port range specified, falling back to the default range [{}:{}]",
            DEFAULT_PORT_RANGE.0,
            DEFAULT_PORT_RANGE.1
        );
        return DEFAULT_PORT_RANGE;
    }
    (range.min as u16, range.max as u16)
}

/// Determine the advertised IP addresses. When a host name is configured and
/// neither address is, the host is resolved and the first A / first AAAA
/// results are used, each independently. Empty strings become absent.
fn resolve_addresses(
    host_name: &str,
    configured_v4: &str,
    configured_v6: &str,
) -> (Option<String>, Option<String>) {
    if !host_name.is_empty() && configured_v4.is_empty() && configured_v6.is_empty() {
        match (host_name, 0u16).to_socket_addrs() {
            Ok(addrs) => {
                let mut v4 = None;
                let mut v6 = None;
                for addr in addrs {
                    match addr.ip() {
                        IpAddr::V4(ip) if v4.is_none() => v4 = Some(ip.to_string()),
                        IpAddr::V6(ip) if v6.is_none() => v6 = Some(ip.to_string()),
                        _ => {}
                    }
                }
                info!(host = host_name, ipv4 = ?v4, ipv6 = ?v6, "resolved host name");
                return (v4, v6);
            }
            Err(e) => {
                warn!(host = host_name, error = %e, "host name resolution failed");
            }
        }
    }

    (
        non_empty(configured_v4.to_string()),
        non_empty(configured_v6.to_string()),
    )
}

/// Empty-string configuration input maps to an absent value.
pub fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse a log level name into a tracing level filter. Unknown names fall
/// back to `info` with a notice, once the sinks are up.
pub fn level_filter(level: &str) -> (tracing_subscriber::filter::LevelFilter, Option<String>) {
    use tracing_subscriber::filter::LevelFilter;
    match level {
        // `fatal` has no tracing equivalent; errors are the closest severity.
        "fatal" | "error" => (LevelFilter::ERROR, None),
        "warning" => (LevelFilter::WARN, None),
        "info" => (LevelFilter::INFO, None),
        "debug" => (LevelFilter::DEBUG, None),
        other => (
            LevelFilter::INFO,
            Some(format!(
                "unknown log level {other:?}, please specify fatal, error, warning, info or debug; defaulting to info"
            )),
        ),
    }
}

/// Convenience for tests and tooling: build a config straight from JSON text.
pub fn from_json(raw: &str) -> Result<Config, ConfigError> {
    let file: ConfigFile = serde_json::from_str(raw).unwrap_or_default();
    Config::build(&file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = Config::build(&ConfigFile::default()).unwrap();
        assert_eq!(config.http_port, 5895);
        assert_eq!(config.https_port, 5898);
        assert_eq!(config.port_min, 9601);
        assert_eq!(config.port_max, 9659);
        assert_eq!(
            config.databases_url.resource,
            "http://localhost:4444/tm1/api/v1/Databases"
        );
        // Derived template: resource plus the OData key.
        assert_eq!(
            config.database_url_template.as_str(),
            "http://localhost:4444/tm1/api/v1/Databases('{{.database}}')"
        );
    }

    #[test]
    fn databases_url_requires_databases_segment() {
        assert!(DatabasesUrl::parse("http://host/tm1/Databases").is_ok());
        assert!(DatabasesUrl::parse("http://host/tm1/Database").is_err());
        assert!(DatabasesUrl::parse("ftp://host/Databases").is_err());
        assert!(DatabasesUrl::parse("host/Databases").is_err());
        assert!(DatabasesUrl::parse("http://host").is_err());
    }

    #[test]
    fn databases_url_keeps_query() {
        let url = DatabasesUrl::parse("https://host/x/Databases?tenant=a#frag").unwrap();
        assert_eq!(url.resource, "https://host/x/Databases");
        assert_eq!(url.query_and_fragment.as_deref(), Some("tenant=a#frag"));
    }

    #[test]
    fn template_normalizes_bare_variable() {
        let template = UrlTemplate::parse("http://host/Databases('{{database}}')").unwrap();
        assert_eq!(template.as_str(), "http://host/Databases('{{.database}}')");
        assert_eq!(
            template.render("Sales"),
            "http://host/Databases('Sales')"
        );
    }

    #[test]
    fn template_accepts_expanded_variable() {
        let template = UrlTemplate::parse("http://host/db/{{.database}}/api").unwrap();
        assert_eq!(template.render("X"), "http://host/db/X/api");
    }

    #[test]
    fn template_rejects_wrong_variable() {
        assert!(UrlTemplate::parse("http://host/{{db}}").is_err());
        assert!(UrlTemplate::parse("http://host/plain").is_err());
        assert!(UrlTemplate::parse("http://host/{{database}}/{{database}}").is_err());
        assert!(UrlTemplate::parse("http://host/{{database").is_err());
    }

    #[test]
    fn derived_template_reappends_query() {
        let url = DatabasesUrl::parse("http://host/tm1/Databases?tenant=a").unwrap();
        let template = UrlTemplate::derived(&url);
        assert_eq!(
            template.render("Planning Sample"),
            "http://host/tm1/Databases('Planning Sample')?tenant=a"
        );
    }

    #[test]
    fn invalid_port_range_falls_back() {
        assert_eq!(
            validate_port_range(&PortRangeSection { min: 0, max: 9000 }),
            DEFAULT_PORT_RANGE
        );
        assert_eq!(
            validate_port_range(&PortRangeSection { min: 9000, max: 70000 }),
            DEFAULT_PORT_RANGE
        );
        assert_eq!(
            validate_port_range(&PortRangeSection { min: 9000, max: 8000 }),
            DEFAULT_PORT_RANGE
        );
        assert_eq!(
            validate_port_range(&PortRangeSection { min: 9601, max: 9659 }),
            (9601, 9659)
        );
    }

    #[test]
    fn listener_ports_required() {
        let mut file = ConfigFile::default();
        file.admsrv.http_port = 0;
        file.admsrv.https_port = 0;
        assert!(matches!(
            Config::build(&file),
            Err(ConfigError::NoListenerPorts)
        ));
    }

    #[test]
    fn kebab_case_sections_parse() {
        let raw = r#"{
            "admsrv": {"http-port": 8080, "https-port": 0},
            "tm1-v12": {
                "databases-url": "http://tm1/api/v1/Databases",
                "auth": {"basic": {"username": "admin", "password": "secret"}}
            },
            "servers": {
                "host-name": "",
                "ip-v4-address": "10.0.0.1",
                "port-range": {"min": 9601, "max": 9605},
                "using-ssl": true
            }
        }"#;
        let config = from_json(raw).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.https_port, 0);
        assert_eq!(config.basic_username, "admin");
        assert_eq!(config.ipv4_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.ipv6_address, None);
        assert_eq!((config.port_min, config.port_max), (9601, 9605));
        assert!(config.using_ssl);
    }
}
