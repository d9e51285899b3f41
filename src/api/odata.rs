//! OData entity shapes for the catalog API.
//!
//! The wire format mirrors the legacy v11 admin server: PascalCase members,
//! nullable strings and integers encoded as JSON `null`, and an
//! `@odata.context` member on every entity-bearing response.

use serde::Serialize;

pub const COLLECTION_CONTEXT: &str = "$metadata#Servers";
pub const ENTITY_CONTEXT: &str = "$metadata#Servers/$entity";

/// One Server entity: the admin-host-side record of an upstream database.
///
/// Nullable members are options; `None` serializes as `null`. The v11-only
/// members (legacy port numbers, certificate metadata) are always absent for
/// v12 databases but stay part of the shape for client compatibility.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEntity {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "SelfRegistered")]
    pub self_registered: bool,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: Option<String>,
    #[serde(rename = "IPv6Address")]
    pub ipv6_address: Option<String>,
    #[serde(rename = "PortNumber")]
    pub port_number: Option<i32>,
    #[serde(rename = "ClientMessagePortNumber")]
    pub client_message_port_number: Option<i32>,
    /// 0 means no port is currently assigned.
    #[serde(rename = "HTTPPortNumber")]
    pub http_port_number: u16,
    #[serde(rename = "IsLocal")]
    pub is_local: bool,
    #[serde(rename = "UsingSSL")]
    pub using_ssl: bool,
    #[serde(rename = "SSLCertificateID")]
    pub ssl_certificate_id: Option<String>,
    #[serde(rename = "SSLCertificateAuthority")]
    pub ssl_certificate_authority: Option<String>,
    #[serde(rename = "SSLCertificateRevocationList")]
    pub ssl_certificate_revocation_list: Option<String>,
    #[serde(rename = "ClientExportSSLSvrCert")]
    pub client_export_ssl_svr_cert: bool,
    #[serde(rename = "ClientExportSSLSvrKeyID")]
    pub client_export_ssl_svr_key_id: Option<String>,
    #[serde(rename = "AcceptingClients")]
    pub accepting_clients: bool,
    #[serde(rename = "LastUpdated")]
    pub last_updated: String,
}

impl ServerEntity {
    /// A fresh entity for a newly observed database. The port, the accepting
    /// flag and the timestamp are filled in by the fleet manager.
    pub fn new(
        name: &str,
        host: String,
        ip_address: Option<String>,
        ipv6_address: Option<String>,
        using_ssl: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            self_registered: false,
            host,
            ip_address,
            ipv6_address,
            port_number: None,
            client_message_port_number: None,
            http_port_number: 0,
            is_local: false,
            using_ssl,
            ssl_certificate_id: None,
            ssl_certificate_authority: None,
            ssl_certificate_revocation_list: None,
            client_export_ssl_svr_cert: false,
            client_export_ssl_svr_key_id: None,
            accepting_clients: false,
            last_updated: String::new(),
        }
    }
}

/// Envelope for a single Server entity.
#[derive(Debug, Serialize)]
pub struct ServerResponse {
    #[serde(rename = "@odata.context")]
    pub context: &'static str,
    #[serde(flatten)]
    pub server: ServerEntity,
}

impl ServerResponse {
    pub fn new(server: ServerEntity) -> Self {
        Self {
            context: ENTITY_CONTEXT,
            server,
        }
    }
}

/// Envelope for the Servers entity set.
#[derive(Debug, Serialize)]
pub struct ServersResponse {
    #[serde(rename = "@odata.context")]
    pub context: &'static str,
    pub value: Vec<ServerEntity>,
}

impl ServersResponse {
    pub fn new(value: Vec<ServerEntity>) -> Self {
        Self {
            context: COLLECTION_CONTEXT,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_serialize_as_null() {
        let entity = ServerEntity::new("Sales", "tm1.example".to_string(), None, None, false);
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["Name"], "Sales");
        assert_eq!(json["Host"], "tm1.example");
        assert!(json["IPAddress"].is_null());
        assert!(json["IPv6Address"].is_null());
        assert!(json["PortNumber"].is_null());
        assert!(json["SSLCertificateID"].is_null());
        assert_eq!(json["HTTPPortNumber"], 0);
        assert_eq!(json["AcceptingClients"], false);
    }

    #[test]
    fn entity_envelope_is_flattened() {
        let mut entity =
            ServerEntity::new("Sales", "tm1.example".to_string(), None, None, false);
        entity.http_port_number = 9601;
        let json = serde_json::to_value(ServerResponse::new(entity)).unwrap();
        assert_eq!(json["@odata.context"], "$metadata#Servers/$entity");
        assert_eq!(json["Name"], "Sales");
        assert_eq!(json["HTTPPortNumber"], 9601);
    }

    #[test]
    fn collection_envelope_has_value_array() {
        let entity = ServerEntity::new("Sales", "h".to_string(), None, None, false);
        let json = serde_json::to_value(ServersResponse::new(vec![entity])).unwrap();
        assert_eq!(json["@odata.context"], "$metadata#Servers");
        assert_eq!(json["value"].as_array().unwrap().len(), 1);
    }
}
