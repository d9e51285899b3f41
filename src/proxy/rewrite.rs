//! Request rewriting for the per-database proxies.
//!
//! Decides, for an incoming request, whether and how it is forwarded to the
//! upstream database. Only two shapes are rewritten: the v1 REST API (the
//! prefix is stripped and the remainder is rebased under the upstream path)
//! and the legacy logout endpoint (turned into the session-close action).
//! Everything else is left alone and ends up in the proxy's error handler.

use axum::http::Method;
use reqwest::Url;

/// The REST API prefix stripped before rebasing. Exactly seven characters so
/// the remainder keeps its leading slash.
const API_V1_PREFIX: &str = "/api/v1/";

/// A fully resolved plan for one upstream exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardPlan {
    pub method: Method,
    pub url: Url,
    /// Replacement body, for requests that are transformed rather than passed.
    pub body_override: Option<&'static [u8]>,
    pub content_type: Option<&'static str>,
}

/// Compute the upstream exchange for a request, or `None` when the request
/// is not one we rewrite.
pub fn plan_forward(
    base: &Url,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> Option<ForwardPlan> {
    if path.starts_with(API_V1_PREFIX) {
        // The proxy targets the service root of the database; make the path
        // relative to that.
        let remainder = &path[API_V1_PREFIX.len() - 1..];
        Some(ForwardPlan {
            method: method.clone(),
            url: rebase(base, remainder, query),
            body_override: None,
            content_type: None,
        })
    } else if path == "/api/logout" {
        // Convert to a POST targeting the session-close action instead.
        Some(ForwardPlan {
            method: Method::POST,
            url: rebase(base, "/ActiveSession/tm1.Close", query),
            body_override: Some(b"{}"),
            content_type: Some("application/json"),
        })
    } else {
        None
    }
}

/// Rebase a path under the upstream URL, merging the upstream query with the
/// request query.
fn rebase(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    url.set_path(&single_joining_slash(base.path(), path));

    let merged = match (base.query(), query.filter(|q| !q.is_empty())) {
        (Some(base_query), Some(query)) => Some(format!("{base_query}&{query}")),
        (Some(base_query), None) => Some(base_query.to_string()),
        (None, Some(query)) => Some(query.to_string()),
        (None, None) => None,
    };
    url.set_query(merged.as_deref());
    url
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}
