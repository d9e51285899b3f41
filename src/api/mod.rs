//! Catalog API: the read-only OData surface describing the proxy fleet.
//!
//! Everything lives under `/api/v1/`; only GET is allowed (other methods get
//! a 405 with `Allow: GET`). Reads drive freshness: both the collection and
//! the single-entity route refresh the fleet before answering.

pub mod documents;
pub mod odata;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::fleet::Fleet;
use documents::{negotiate_metadata, MetadataFormat, SERVICE_DOCUMENT_FILE};
use odata::{ServerResponse, ServersResponse};

#[derive(Clone)]
pub struct ApiState {
    fleet: Fleet,
}

/// Build the catalog API router.
pub fn router(fleet: Fleet) -> Router {
    Router::new()
        .route("/api/v1/", get(service_document))
        .route("/api/v1/$metadata", get(metadata_document))
        .route("/api/v1/Servers", get(server_collection))
        .route("/api/v1/{entity}", get(server_entity))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { fleet })
}

/// The OData service document, JSON only.
async fn service_document() -> Response {
    match tokio::fs::read(SERVICE_DOCUMENT_FILE).await {
        Ok(bytes) => document_response("application/json", bytes),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read service document (JSON) file",
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MetadataQuery {
    #[serde(rename = "$format")]
    format: Option<String>,
}

/// The metadata document, JSON or XML per content negotiation.
async fn metadata_document(Query(query): Query<MetadataQuery>, headers: HeaderMap) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());

    let format = match negotiate_metadata(query.format.as_deref(), accept) {
        Ok(format) => format,
        Err(()) => {
            return (
                StatusCode::BAD_REQUEST,
                "Content-Type specified in $format query parameter not supported",
            )
                .into_response();
        }
    };

    match tokio::fs::read(format.file()).await {
        Ok(bytes) => document_response(format.content_type(), bytes),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            match format {
                MetadataFormat::Json => "Failed to read $metadata (JSON) file",
                MetadataFormat::Xml => "Failed to read $metadata (XML) file",
            },
        )
            .into_response(),
    }
}

/// The Servers entity set, refreshed on demand.
async fn server_collection(State(state): State<ApiState>) -> Response {
    let servers = state.fleet.list_servers().await;
    entity_response(Json(ServersResponse::new(servers)))
}

/// A single Server entity addressed as `Servers('<name>')`.
async fn server_entity(
    State(state): State<ApiState>,
    Path(entity): Path<String>,
) -> Response {
    let Some(name) = parse_entity_key(&entity) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match state.fleet.lookup_server(name).await {
        Some(server) => entity_response(Json(ServerResponse::new(server))),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Extract the server name from an OData key path segment.
fn parse_entity_key(segment: &str) -> Option<&str> {
    let name = segment
        .strip_prefix("Servers('")?
        .strip_suffix("')")?;
    (!name.is_empty()).then_some(name)
}

fn document_response(content_type: &'static str, bytes: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
        Body::from(bytes),
    )
        .into_response()
}

fn entity_response(body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_parses() {
        assert_eq!(parse_entity_key("Servers('Sales')"), Some("Sales"));
        assert_eq!(
            parse_entity_key("Servers('Planning Sample')"),
            Some("Planning Sample")
        );
    }

    #[test]
    fn entity_key_rejects_malformed_segments() {
        assert_eq!(parse_entity_key("Servers('')"), None);
        assert_eq!(parse_entity_key("Servers(Sales)"), None);
        assert_eq!(parse_entity_key("Servers('Sales'"), None);
        assert_eq!(parse_entity_key("Databases('Sales')"), None);
        assert_eq!(parse_entity_key("Servers"), None);
    }
}
