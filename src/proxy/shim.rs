//! Legacy internal API shim.
//!
//! Very old clients still probe a private API that predates the REST
//! surface. The upstream no longer implements it, so the proxies answer
//! these three resources inline with fixed payloads when an exchange cannot
//! be completed upstream.

/// The path prefix of the legacy internal API.
const INTERNAL_PREFIX: &str = "/api/internal/";

/// Fixed capabilities collection.
pub const CAPABILITIES: &str = r#"[ { "name" : "RunServerExplorer", "permissions" : [ { "name" : "Execute", "policy" : "" } ] }, { "name" : "UsePersonalWorkspaceWritebackMode", "permissions" : [ { "name" : "Execute", "policy" : "" } ] }, { "name" : "UseSandbox", "permissions" : [ { "name" : "Execute", "policy" : "Grant" } ] }, { "name" : "ManageDataReservation", "permissions" : [ { "name" : "Execute", "policy" : "Grant" } ] }, { "name" : "DataReservationOverride", "permissions" : [ { "name" : "Execute", "policy" : "Grant" } ] }, { "name" : "Consolidation TypeIn Spreading", "permissions" : [ { "name" : "Execute", "policy" : "Grant" } ] }, { "name" : "Allow Spreading", "permissions" : [ { "name" : "Execute", "policy" : "Grant" } ] }, { "name" : "Allow Export as Text", "permissions" : [ { "name" : "Execute", "policy" : "Grant" } ] } ]"#;

/// Fixed configuration object.
pub const CONFIGURATION: &str = r#"{ "ServerName" : "Planning Sample", "AdminHost" : "", "ProductVersion" : "12.4.5", "PortNumber" : 0, "ClientMessagePortNumber" : 0, "HTTPPortNumber" : 12555, "IntegratedSecurityMode" : 1, "SecurityMode" : "Basic", "ClientCAMURI" : "", "AllowSeparateNandCRules" : 0, "DistributedOutputDir" : "", "DisableSandboxing" : false, "JobQueuing" : false, "ForceReevaluationOfFeedersForFedCellsOnDataChange" : false, "DataBaseDirectory" : "c:\\users\\037583788\\w\\bin\\tm1\\data\\plansamp", "UnicodeUpperLowerCase" : true, "IdleConnectionTimeOutSeconds" : 0 }"#;

/// Sandboxes are reported as an empty collection.
pub const SANDBOXES: &str = "[]";

/// Outcome of matching a path against the legacy internal API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimMatch {
    /// A known resource with its fixed payload.
    Resource(&'static str),
    /// Under the internal prefix, but not a resource we answer.
    UnknownInternal,
    /// Not a legacy internal API path at all.
    NotInternal,
}

/// Match a request path against the legacy internal API. Only `v1` and
/// `v1.1` are recognized versions, each with exactly one trailing resource
/// segment.
pub fn match_path(path: &str) -> ShimMatch {
    let Some(rest) = path.strip_prefix(INTERNAL_PREFIX) else {
        return ShimMatch::NotInternal;
    };

    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() == 2 && (segments[0] == "v1" || segments[0] == "v1.1") {
        match segments[1] {
            "capabilities" => return ShimMatch::Resource(CAPABILITIES),
            "configuration" => return ShimMatch::Resource(CONFIGURATION),
            "sandboxes" => return ShimMatch::Resource(SANDBOXES),
            _ => {}
        }
    }
    ShimMatch::UnknownInternal
}
